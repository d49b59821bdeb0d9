mod dictionary;
mod structs;
mod tables;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::formats::pfs::FileStorage;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorageError, StorageError,
};

pub use dictionary::{DictionaryError, RomEntryKey, RomFsDictionary};
pub use structs::{
    DirectoryRomEntry, FileRomEntry, FindPosition, RomFileInfo, RomFsHeader, RomId,
};
pub use tables::HierarchicalRomTables;

#[derive(Snafu, Debug)]
pub enum RomFsParseError {
    /// RomFS: failed to parse the header
    Parsing { source: binrw::Error },
    /// RomFS: failed to load a table
    Dictionary { source: DictionaryError },
    /// RomFS: a table lies outside the storage
    TableBounds { source: SliceStorageError },
    /// RomFS: the root directory is missing
    NoRootDirectory,
}

/// The read-only filesystem behind an IVFC-protected NCA section: four
/// packed lookup tables and a data region.
#[derive(Debug)]
pub struct RomFileSystem<S: ReadableStorage> {
    storage: SharedStorage<S>,
    tables: HierarchicalRomTables,
    data_offset: u64,
}

impl<S: ReadableStorage> RomFileSystem<S> {
    pub fn new(storage: S) -> Result<Self, RomFsParseError> {
        let storage = storage.shared();
        let header = RomFsHeader::read(&mut storage.clone().buf_read()).context(ParsingSnafu)?;

        let table = |offset: u64, size: u64| {
            storage.clone().slice(offset, size).context(TableBoundsSnafu)
        };

        let directory_table = RomFsDictionary::from_storage(
            table(header.dir_hash_table_offset, header.dir_hash_table_size)?,
            table(header.dir_meta_table_offset, header.dir_meta_table_size)?,
        )
        .context(DictionarySnafu)?;
        let file_table = RomFsDictionary::from_storage(
            table(header.file_hash_table_offset, header.file_hash_table_size)?,
            table(header.file_meta_table_offset, header.file_meta_table_size)?,
        )
        .context(DictionarySnafu)?;

        if header.dir_meta_table_size == 0 {
            return Err(RomFsParseError::NoRootDirectory);
        }

        Ok(Self {
            storage,
            tables: HierarchicalRomTables::new(file_table, directory_table),
            data_offset: header.data_offset,
        })
    }
}

#[derive(Debug)]
pub struct File<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    name: &'a str,
    info: RomFileInfo,
}

#[derive(Debug)]
pub struct Directory<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    name: &'a str,
    position: FindPosition,
}

pub struct DirectoryIter<'a, S: ReadableStorage> {
    fs: &'a RomFileSystem<S>,
    position: FindPosition,
}

#[derive(Snafu, Debug)]
pub enum RomFsOpenError {
    /// RomFS: file data lies outside the data region
    Slice { source: SliceStorageError },
}

impl<'a, S: ReadableStorage> ReadableFile for File<'a, S> {
    type Storage = FileStorage<S>;
    type Error = RomFsOpenError;

    fn name(&self) -> &str {
        self.name
    }

    fn size(&self) -> u64 {
        self.info.size
    }

    fn storage(&self) -> Result<Self::Storage, Self::Error> {
        self.fs
            .storage
            .clone()
            .slice(self.fs.data_offset + self.info.offset, self.info.size)
            .context(SliceSnafu)
    }
}

impl<'a, S: ReadableStorage> ReadableDirectory for Directory<'a, S> {
    type File = File<'a, S>;
    type Iter = DirectoryIter<'a, S>;

    fn name(&self) -> &str {
        self.name
    }

    fn entries(&self) -> Self::Iter {
        DirectoryIter {
            fs: self.fs,
            position: self.position,
        }
    }
}

impl<'a, S: ReadableStorage> Iterator for DirectoryIter<'a, S> {
    type Item = Entry<File<'a, S>, Directory<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        // files first, then the child directories
        if let Some((name, info)) = self.fs.tables.next_file(&mut self.position) {
            return Some(Entry::File(File {
                fs: self.fs,
                name,
                info,
            }));
        }

        self.fs
            .tables
            .next_directory(&mut self.position)
            .map(|(name, position)| {
                Entry::Directory(Directory {
                    fs: self.fs,
                    name,
                    position,
                })
            })
    }
}

impl<S: ReadableStorage> ReadableFileSystem for RomFileSystem<S> {
    type File<'a> = File<'a, S> where Self: 'a;
    type Directory<'a> = Directory<'a, S> where Self: 'a;

    fn root(&self) -> Self::Directory<'_> {
        let (name, position) = self.tables.root();
        Directory {
            fs: self,
            name,
            position,
        }
    }

    fn open_file(&self, path: &str) -> Option<Self::File<'_>> {
        self.tables.get_file(path).map(|(name, info)| File {
            fs: self,
            name,
            info,
        })
    }

    fn open_directory(&self, path: &str) -> Option<Self::Directory<'_>> {
        self.tables
            .get_directory(path)
            .map(|(name, position)| Directory {
                fs: self,
                name,
                position,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extract::{extract_filesystem, list_files, VecSink};
    use crate::storage::VecStorage;

    fn align4(v: usize) -> usize {
        (v + 3) & !3
    }

    pub(crate) struct RomFsDirSpec {
        /// entry id of the parent directory (root is 0)
        pub parent: usize,
        pub name: &'static str,
        pub first_child_dir: Option<usize>,
        pub first_file: Option<usize>,
        pub next_sibling: Option<usize>,
    }

    pub(crate) struct RomFsFileSpec {
        pub parent: usize,
        pub name: &'static str,
        pub contents: &'static [u8],
        pub next_sibling: Option<usize>,
    }

    /// Builds a RomFS image with single-bucket hash tables; all entries
    /// simply chain through the bucket.
    pub(crate) fn build_romfs(dirs: &[RomFsDirSpec], files: &[RomFsFileSpec]) -> Vec<u8> {
        // first pass: compute entry offsets
        let dir_offsets: Vec<usize> = dirs
            .iter()
            .scan(0usize, |acc, d| {
                let offset = *acc;
                *acc += 0x18 + align4(d.name.len());
                Some(offset)
            })
            .collect();
        let file_offsets: Vec<usize> = files
            .iter()
            .scan(0usize, |acc, f| {
                let offset = *acc;
                *acc += 0x20 + align4(f.name.len());
                Some(offset)
            })
            .collect();

        let id = |offsets: &[usize], index: Option<usize>| -> i32 {
            index.map(|i| offsets[i] as i32).unwrap_or(-1)
        };

        let mut dir_meta = Vec::new();
        for (i, d) in dirs.iter().enumerate() {
            dir_meta.extend_from_slice(&(dir_offsets[d.parent] as i32).to_le_bytes());
            dir_meta.extend_from_slice(&id(&dir_offsets, d.next_sibling).to_le_bytes());
            dir_meta.extend_from_slice(&id(&dir_offsets, d.first_child_dir).to_le_bytes());
            dir_meta.extend_from_slice(&id(&file_offsets, d.first_file).to_le_bytes());
            // hash chain: next entry in the table, if any
            let chain = if i + 1 < dirs.len() {
                dir_offsets[i + 1] as i32
            } else {
                -1
            };
            dir_meta.extend_from_slice(&chain.to_le_bytes());
            dir_meta.extend_from_slice(&(d.name.len() as u32).to_le_bytes());
            dir_meta.extend_from_slice(d.name.as_bytes());
            dir_meta.resize(align4(dir_meta.len()), 0);
        }

        let mut data = Vec::new();
        let mut file_meta = Vec::new();
        for (i, f) in files.iter().enumerate() {
            let data_offset = data.len() as u64;
            data.extend_from_slice(f.contents);
            data.resize(align4(data.len()), 0);

            file_meta.extend_from_slice(&(dir_offsets[f.parent] as i32).to_le_bytes());
            file_meta.extend_from_slice(&id(&file_offsets, f.next_sibling).to_le_bytes());
            file_meta.extend_from_slice(&data_offset.to_le_bytes());
            file_meta.extend_from_slice(&(f.contents.len() as u64).to_le_bytes());
            let chain = if i + 1 < files.len() {
                file_offsets[i + 1] as i32
            } else {
                -1
            };
            file_meta.extend_from_slice(&chain.to_le_bytes());
            file_meta.extend_from_slice(&(f.name.len() as u32).to_le_bytes());
            file_meta.extend_from_slice(f.name.as_bytes());
            file_meta.resize(align4(file_meta.len()), 0);
        }

        // single-bucket hash tables pointing at the first entry
        let dir_hash = (if dirs.is_empty() { -1i32 } else { 0 }).to_le_bytes();
        let file_hash = (if files.is_empty() { -1i32 } else { 0 }).to_le_bytes();

        let dir_hash_offset = 0x50u64;
        let dir_meta_offset = dir_hash_offset + dir_hash.len() as u64;
        let file_hash_offset = dir_meta_offset + dir_meta.len() as u64;
        let file_meta_offset = file_hash_offset + file_hash.len() as u64;
        let data_offset = file_meta_offset + file_meta.len() as u64;

        let mut image = Vec::new();
        for field in [
            0x50,
            dir_hash_offset,
            dir_hash.len() as u64,
            dir_meta_offset,
            dir_meta.len() as u64,
            file_hash_offset,
            file_hash.len() as u64,
            file_meta_offset,
            file_meta.len() as u64,
            data_offset,
        ] {
            image.extend_from_slice(&field.to_le_bytes());
        }
        image.extend_from_slice(&dir_hash);
        image.extend_from_slice(&dir_meta);
        image.extend_from_slice(&file_hash);
        image.extend_from_slice(&file_meta);
        image.extend_from_slice(&data);
        image
    }

    pub(crate) fn sample_romfs() -> Vec<u8> {
        // /a.txt, /sub/b.bin
        build_romfs(
            &[
                RomFsDirSpec {
                    parent: 0,
                    name: "",
                    first_child_dir: Some(1),
                    first_file: Some(0),
                    next_sibling: None,
                },
                RomFsDirSpec {
                    parent: 0,
                    name: "sub",
                    first_child_dir: None,
                    first_file: Some(1),
                    next_sibling: None,
                },
            ],
            &[
                RomFsFileSpec {
                    parent: 0,
                    name: "a.txt",
                    contents: b"alpha",
                    next_sibling: None,
                },
                RomFsFileSpec {
                    parent: 1,
                    name: "b.bin",
                    contents: b"bravo!",
                    next_sibling: None,
                },
            ],
        )
    }

    #[test]
    fn walks_the_tree() {
        let fs = RomFileSystem::new(VecStorage::new(sample_romfs())).unwrap();

        assert_eq!(list_files(&fs), vec!["a.txt", "sub/b.bin"]);

        let mut sink = VecSink::default();
        extract_filesystem(&fs, &mut sink).unwrap();
        assert_eq!(
            sink.files,
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("sub/b.bin".to_string(), b"bravo!".to_vec()),
            ]
        );
    }

    #[test]
    fn paths_are_unique() {
        let fs = RomFileSystem::new(VecStorage::new(sample_romfs())).unwrap();
        let paths = list_files(&fs);
        let mut deduped = paths.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(paths.len(), deduped.len());
    }

    #[test]
    fn opens_by_path() {
        let fs = RomFileSystem::new(VecStorage::new(sample_romfs())).unwrap();

        let file = fs.open_file("sub/b.bin").unwrap();
        assert_eq!(file.name(), "b.bin");
        assert_eq!(file.storage().unwrap().read_all().unwrap(), b"bravo!");

        assert!(fs.open_file("sub").is_none());
        assert!(fs.open_file("missing/b.bin").is_none());

        let dir = fs.open_directory("sub").unwrap();
        assert_eq!(dir.name(), "sub");
        assert!(fs.open_directory("").is_some());
    }
}
