mod structs;

use binrw::BinRead;
use indexmap::IndexMap;
use snafu::{ResultExt, Snafu};

use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::storage::{
    FileRoStorage, ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage, StorageError,
};

pub use structs::{PfsFileEntry, PfsHeader, PFS_ENTRY_SIZE, PFS_HEADER_SIZE};

/// Storage of one file inside a partition; also reused by the RomFS decoder.
pub type FileStorage<S> = SliceStorage<SharedStorage<S>>;

#[derive(Snafu, Debug)]
pub enum PfsParseError {
    /// PFS0: failed to parse the header
    Parsing { source: binrw::Error },
    /// PFS0: failed to read from the storage
    Storage { source: StorageError },
    /// PFS0: tables do not fit into the storage
    #[snafu(display("PFS0: tables of size {} do not fit into storage of size {}", tables_size, storage_size))]
    TruncatedTables {
        tables_size: u64,
        storage_size: u64,
    },
    /// PFS0: file {name} at {offset:#x}+{size:#x} lies outside the data region
    TruncatedFile { name: String, offset: u64, size: u64 },
    /// PFS0: a file name is not valid UTF-8
    BadFileName { source: std::str::Utf8Error },
}

/// A flat partition filesystem: a file table, a string table, packed data.
#[derive(Debug)]
pub struct PartitionFileSystem<S: ReadableStorage> {
    storage: SharedStorage<S>,
    entries: IndexMap<String, PfsFileEntry>,
    data_offset: u64,
}

impl<S: ReadableStorage> PartitionFileSystem<S> {
    pub fn new(storage: S) -> Result<Self, PfsParseError> {
        let storage = storage.shared();
        let mut io = storage.clone().buf_read();

        let header = PfsHeader::read(&mut io).context(ParsingSnafu)?;

        let tables_size = PFS_HEADER_SIZE
            + header.file_count as u64 * PFS_ENTRY_SIZE
            + header.string_table_size as u64;
        if tables_size > storage.get_size() {
            return Err(PfsParseError::TruncatedTables {
                tables_size,
                storage_size: storage.get_size(),
            });
        }

        let mut raw_entries = Vec::with_capacity(header.file_count as usize);
        for _ in 0..header.file_count {
            raw_entries.push(PfsFileEntry::read(&mut io).context(ParsingSnafu)?);
        }

        let string_table = storage
            .clone()
            .slice(
                PFS_HEADER_SIZE + header.file_count as u64 * PFS_ENTRY_SIZE,
                header.string_table_size as u64,
            )
            .expect("BUG: string table bounds already checked")
            .read_all()
            .context(StorageSnafu)?;

        let data_offset = tables_size;
        let data_size = storage.get_size() - data_offset;

        let mut entries = IndexMap::with_capacity(raw_entries.len());
        for entry in raw_entries {
            let name = string_table
                .get(entry.string_offset as usize..)
                .map(|s| s.split(|&b| b == 0).next().unwrap_or(s))
                .unwrap_or(&[]);
            let name = std::str::from_utf8(name)
                .context(BadFileNameSnafu)?
                .to_string();

            if entry.offset + entry.size > data_size {
                return Err(PfsParseError::TruncatedFile {
                    name,
                    offset: entry.offset,
                    size: entry.size,
                });
            }

            entries.insert(name, entry);
        }

        Ok(Self {
            storage,
            entries,
            data_offset,
        })
    }

    pub fn file_count(&self) -> usize {
        self.entries.len()
    }
}

impl PartitionFileSystem<FileRoStorage> {
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, PfsParseError> {
        let storage = FileRoStorage::open(path).context(StorageSnafu)?;
        Self::new(storage)
    }
}

#[derive(Debug)]
pub struct File<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
    name: &'a str,
    entry: &'a PfsFileEntry,
}

#[derive(Debug)]
pub struct Directory<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
}

pub struct DirectoryIter<'a, S: ReadableStorage> {
    fs: &'a PartitionFileSystem<S>,
    inner: indexmap::map::Iter<'a, String, PfsFileEntry>,
}

#[derive(Snafu, Debug)]
pub enum PfsOpenError {
    /// PFS0: file storage could not be sliced
    Slice {
        source: crate::storage::SliceStorageError,
    },
}

impl<'a, S: ReadableStorage> ReadableFile for File<'a, S> {
    type Storage = FileStorage<S>;
    type Error = PfsOpenError;

    fn name(&self) -> &str {
        self.name
    }

    fn size(&self) -> u64 {
        self.entry.size
    }

    fn storage(&self) -> Result<Self::Storage, Self::Error> {
        self.fs
            .storage
            .clone()
            .slice(self.fs.data_offset + self.entry.offset, self.entry.size)
            .context(SliceSnafu)
    }
}

impl<'a, S: ReadableStorage> ReadableDirectory for Directory<'a, S> {
    type File = File<'a, S>;
    type Iter = DirectoryIter<'a, S>;

    fn name(&self) -> &str {
        ""
    }

    fn entries(&self) -> Self::Iter {
        DirectoryIter {
            fs: self.fs,
            inner: self.fs.entries.iter(),
        }
    }
}

impl<'a, S: ReadableStorage> Iterator for DirectoryIter<'a, S> {
    type Item = Entry<File<'a, S>, Directory<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, entry) = self.inner.next()?;
        Some(Entry::File(File {
            fs: self.fs,
            name,
            entry,
        }))
    }
}

impl<S: ReadableStorage> ReadableFileSystem for PartitionFileSystem<S> {
    type File<'a> = File<'a, S> where Self: 'a;
    type Directory<'a> = Directory<'a, S> where Self: 'a;

    fn root(&self) -> Self::Directory<'_> {
        Directory { fs: self }
    }

    fn open_file(&self, path: &str) -> Option<Self::File<'_>> {
        let path = path.trim_start_matches('/');
        self.entries.get_key_value(path).map(|(name, entry)| File {
            fs: self,
            name,
            entry,
        })
    }

    fn open_directory(&self, path: &str) -> Option<Self::Directory<'_>> {
        // a partition has no directory structure, only the root
        matches!(path.trim_start_matches('/'), "").then(|| self.root())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extract::{extract_filesystem, VecSink};
    use crate::storage::VecStorage;

    /// Packs a PFS0 image from (name, contents) pairs.
    pub(crate) fn build_pfs(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut string_table = Vec::new();
        let mut data = Vec::new();
        let mut entries = Vec::new();
        for (name, contents) in files {
            entries.push((data.len() as u64, contents.len() as u64, string_table.len() as u32));
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
            data.extend_from_slice(contents);
        }

        let mut image = Vec::new();
        image.extend_from_slice(b"PFS0");
        image.extend_from_slice(&(files.len() as u32).to_le_bytes());
        image.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0; 4]);
        for (offset, size, string_offset) in entries {
            image.extend_from_slice(&offset.to_le_bytes());
            image.extend_from_slice(&size.to_le_bytes());
            image.extend_from_slice(&string_offset.to_le_bytes());
            image.extend_from_slice(&[0; 4]);
        }
        image.extend_from_slice(&string_table);
        image.extend_from_slice(&data);
        image
    }

    #[test]
    fn three_files_enumerate_in_header_order() {
        let image = build_pfs(&[
            ("a", b"first" as &[u8]),
            ("b", b"second"),
            ("c", b"third"),
        ]);
        let fs = PartitionFileSystem::new(VecStorage::new(image)).unwrap();

        let mut sink = VecSink::default();
        extract_filesystem(&fs, &mut sink).unwrap();

        assert_eq!(
            sink.files,
            vec![
                ("a".to_string(), b"first".to_vec()),
                ("b".to_string(), b"second".to_vec()),
                ("c".to_string(), b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn open_file_reads_advertised_range() {
        let image = build_pfs(&[("data.bin", b"0123456789" as &[u8])]);
        let fs = PartitionFileSystem::new(VecStorage::new(image)).unwrap();

        let file = fs.open_file("data.bin").unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(file.storage().unwrap().read_all().unwrap(), b"0123456789");
        assert!(fs.open_file("nope").is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let image = b"HFS0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec();
        assert!(matches!(
            PartitionFileSystem::new(VecStorage::new(image)),
            Err(PfsParseError::Parsing { .. })
        ));
    }

    #[test]
    fn truncated_tables_are_rejected() {
        let mut image = build_pfs(&[("a", b"x" as &[u8])]);
        // claim a string table larger than the file
        image[8..12].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(matches!(
            PartitionFileSystem::new(VecStorage::new(image)),
            Err(PfsParseError::TruncatedTables { .. })
        ));
    }
}
