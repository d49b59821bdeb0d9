use crate::formats::romfs::dictionary::{RomEntryKey, RomFsDictionary};
use crate::formats::romfs::structs::{
    DirectoryRomEntry, FileRomEntry, FindPosition, RomFileInfo, RomId,
};

#[derive(Debug)]
pub struct HierarchicalRomTables {
    file_table: RomFsDictionary<FileRomEntry>,
    directory_table: RomFsDictionary<DirectoryRomEntry>,
}

impl HierarchicalRomTables {
    pub fn new(
        file_table: RomFsDictionary<FileRomEntry>,
        directory_table: RomFsDictionary<DirectoryRomEntry>,
    ) -> Self {
        Self {
            file_table,
            directory_table,
        }
    }

    /// Walks the directory components of `path`, returning the id of the
    /// directory containing the last component along with that component.
    fn resolve_parent<'a>(&self, path: &'a str) -> Option<RomEntryKey<'a>> {
        let path = path.trim_matches('/');
        let mut parent = RomId::ROOT_DIR;
        let mut components = path.split('/').peekable();

        while let Some(component) = components.next() {
            if components.peek().is_none() {
                return Some(RomEntryKey {
                    name: component,
                    parent,
                });
            }
            parent = self.directory_table.get_id_from_key(RomEntryKey {
                name: component,
                parent,
            })?;
        }

        None
    }

    pub fn get_file(&self, path: &str) -> Option<(&str, RomFileInfo)> {
        let key = self.resolve_parent(path)?;

        self.file_table
            .get_entry_by_key(key)
            .map(|(name, v)| (name, v.value.info))
    }

    pub fn get_directory(&self, path: &str) -> Option<(&str, FindPosition)> {
        if path.trim_matches('/').is_empty() {
            return Some(self.root());
        }

        let key = self.resolve_parent(path)?;

        self.directory_table
            .get_entry_by_key(key)
            .map(|(name, v)| (name, v.value.position))
    }

    pub fn root(&self) -> (&str, FindPosition) {
        let (name, entry) = self.directory_table.get_entry_by_id(RomId::ROOT_DIR);
        (name, entry.value.position)
    }

    pub fn next_file(&self, position: &mut FindPosition) -> Option<(&str, RomFileInfo)> {
        if position.next_file.is_none() {
            return None;
        }

        let (name, entry) = self.file_table.get_entry_by_id(position.next_file);

        position.next_file = entry.value.next_sibling;

        Some((name, entry.value.info))
    }

    pub fn next_directory(&self, position: &mut FindPosition) -> Option<(&str, FindPosition)> {
        if position.next_directory.is_none() {
            return None;
        }

        let (name, entry) = self
            .directory_table
            .get_entry_by_id(position.next_directory);

        position.next_directory = entry.value.next_sibling;

        Some((name, entry.value.position))
    }
}
