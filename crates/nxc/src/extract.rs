use crate::filesystem::{
    Entry, ReadableDirectoryExt, ReadableFile, ReadableFileSystem,
};
use crate::storage::ReadableStorage;
use snafu::Snafu;

#[derive(Snafu, Debug)]
pub enum ExtractError {
    /// Opening a file of the source filesystem failed
    #[snafu(display("Failed to open {}: {}", path, message))]
    Open { path: String, message: String },
    /// The sink could not store the emitted file (or reading the source
    /// bytes failed, including integrity failures in full-verification mode)
    #[snafu(display("Sink failed on {}: {}", path, source))]
    Sink {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Receives extracted files.
///
/// Paths are `/`-separated, relative (no leading `/`, no `..` components);
/// creating intermediate directories is the sink's concern. A file is only
/// emitted if its bytes could be produced, so a sink never sees
/// unauthenticated partial data.
pub trait ExtractSink {
    fn emit(
        &mut self,
        path: &str,
        storage: &dyn ReadableStorage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Walks the filesystem depth-first and feeds every file to the sink.
pub fn extract_filesystem<F: ReadableFileSystem, K: ExtractSink>(
    fs: &F,
    sink: &mut K,
) -> Result<(), ExtractError> {
    for (path, entry) in fs.root().entries_recursive() {
        let Entry::File(file) = entry else { continue };

        let storage = file.storage().map_err(|e| ExtractError::Open {
            path: path.clone(),
            message: e.to_string(),
        })?;

        tracing::debug!(%path, size = storage.get_size(), "extracting");
        sink.emit(&path, &storage)
            .map_err(|source| ExtractError::Sink {
                path: path.clone(),
                source,
            })?;
    }

    Ok(())
}

/// The path catalog of a filesystem: every file path, in traversal order.
pub fn list_files<F: ReadableFileSystem>(fs: &F) -> Vec<String> {
    fs.root()
        .entries_recursive()
        .filter_map(|(path, entry)| matches!(entry, Entry::File(_)).then_some(path))
        .collect()
}

/// Test sink collecting emitted files in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct VecSink {
    pub files: Vec<(String, Vec<u8>)>,
}

#[cfg(test)]
impl ExtractSink for VecSink {
    fn emit(
        &mut self,
        path: &str,
        storage: &dyn ReadableStorage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use crate::storage::ReadableStorageExt;
        assert!(!path.starts_with('/') && !path.split('/').any(|c| c == ".."));
        self.files.push((path.to_string(), storage.read_all()?));
        Ok(())
    }
}
