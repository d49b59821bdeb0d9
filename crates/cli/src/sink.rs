use camino::Utf8PathBuf;
use nxc::extract::ExtractSink;
use nxc::storage::{ReadableStorage, ReadableStorageExt};

/// Writes extracted files under a root directory, creating intermediate
/// directories as needed.
pub struct DirectorySink {
    root: Utf8PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ExtractSink for DirectorySink {
    fn emit(
        &mut self,
        path: &str,
        storage: &dyn ReadableStorage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // the walker only produces clean relative paths, but this sink is
        // also reachable with caller-supplied names
        if path.starts_with('/') || path.split('/').any(|c| c == ".." || c.is_empty()) {
            return Err(format!("refusing to write suspicious path {:?}", path).into());
        }

        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        println!("Saving {}...", target);
        storage.save_to_file(&target)?;
        Ok(())
    }
}
