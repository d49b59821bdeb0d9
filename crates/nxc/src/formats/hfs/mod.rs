mod structs;

use binrw::BinRead;
use indexmap::IndexMap;
use snafu::{ResultExt, Snafu};

use crate::crypto::sha256;
use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::formats::pfs::FileStorage;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, StorageError,
};

pub use structs::{HfsFileEntry, HfsHeader, HFS_ENTRY_SIZE, HFS_HEADER_SIZE};

#[derive(Snafu, Debug)]
pub enum HfsParseError {
    /// HFS0: failed to parse the header
    Parsing { source: binrw::Error },
    /// HFS0: failed to read from the storage
    Storage { source: StorageError },
    /// HFS0: tables do not fit into the storage
    #[snafu(display("HFS0: tables of size {} do not fit into storage of size {}", tables_size, storage_size))]
    TruncatedTables {
        tables_size: u64,
        storage_size: u64,
    },
    /// HFS0: file {name} at {offset:#x}+{size:#x} lies outside the data region
    TruncatedFile { name: String, offset: u64, size: u64 },
    /// HFS0: a file name is not valid UTF-8
    BadFileName { source: std::str::Utf8Error },
}

/// Like a PFS0, but every file carries a SHA-256 over a prefix of its data.
#[derive(Debug)]
pub struct HashedFileSystem<S: ReadableStorage> {
    storage: SharedStorage<S>,
    entries: IndexMap<String, HfsFileEntry>,
    data_offset: u64,
}

impl<S: ReadableStorage> HashedFileSystem<S> {
    pub fn new(storage: S) -> Result<Self, HfsParseError> {
        let storage = storage.shared();
        let mut io = storage.clone().buf_read();

        let header = HfsHeader::read(&mut io).context(ParsingSnafu)?;

        let tables_size = HFS_HEADER_SIZE
            + header.file_count as u64 * HFS_ENTRY_SIZE
            + header.string_table_size as u64;
        if tables_size > storage.get_size() {
            return Err(HfsParseError::TruncatedTables {
                tables_size,
                storage_size: storage.get_size(),
            });
        }

        let mut raw_entries = Vec::with_capacity(header.file_count as usize);
        for _ in 0..header.file_count {
            raw_entries.push(HfsFileEntry::read(&mut io).context(ParsingSnafu)?);
        }

        let string_table = storage
            .clone()
            .slice(
                HFS_HEADER_SIZE + header.file_count as u64 * HFS_ENTRY_SIZE,
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
                return Err(HfsParseError::TruncatedFile {
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

    /// Checks the stored hash of one file against the first `hashed_size`
    /// bytes of its data.
    pub fn verify_file(&self, name: &str) -> Result<bool, StorageError> {
        let Some(entry) = self.entries.get(name) else {
            return Ok(false);
        };

        let mut hashed_region = vec![0; entry.hashed_size as usize];
        self.storage
            .read(self.data_offset + entry.offset, &mut hashed_region)?;

        Ok(sha256(&hashed_region) == entry.hash.0)
    }

    /// Hash check over every file; returns `(name, matches)` in header order.
    pub fn verify_all(&self) -> Result<Vec<(String, bool)>, StorageError> {
        self.entries
            .keys()
            .map(|name| Ok((name.clone(), self.verify_file(name)?)))
            .collect()
    }
}

#[derive(Debug)]
pub struct File<'a, S: ReadableStorage> {
    fs: &'a HashedFileSystem<S>,
    name: &'a str,
    entry: &'a HfsFileEntry,
}

#[derive(Debug)]
pub struct Directory<'a, S: ReadableStorage> {
    fs: &'a HashedFileSystem<S>,
}

pub struct DirectoryIter<'a, S: ReadableStorage> {
    fs: &'a HashedFileSystem<S>,
    inner: indexmap::map::Iter<'a, String, HfsFileEntry>,
}

#[derive(Snafu, Debug)]
pub enum HfsOpenError {
    /// HFS0: file storage could not be sliced
    Slice {
        source: crate::storage::SliceStorageError,
    },
}

impl<'a, S: ReadableStorage> ReadableFile for File<'a, S> {
    type Storage = FileStorage<S>;
    type Error = HfsOpenError;

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

impl<S: ReadableStorage> ReadableFileSystem for HashedFileSystem<S> {
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
        matches!(path.trim_start_matches('/'), "").then(|| self.root())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::VecStorage;

    /// Packs an HFS0 image; every file is hashed over its full contents.
    pub(crate) fn build_hfs(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut string_table = Vec::new();
        let mut data = Vec::new();
        let mut entries = Vec::new();
        for (name, contents) in files {
            entries.push((
                data.len() as u64,
                contents.len() as u64,
                string_table.len() as u32,
                sha256(contents),
            ));
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
            data.extend_from_slice(contents);
        }

        let mut image = Vec::new();
        image.extend_from_slice(b"HFS0");
        image.extend_from_slice(&(files.len() as u32).to_le_bytes());
        image.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0; 4]);
        for (offset, size, string_offset, hash) in entries {
            image.extend_from_slice(&offset.to_le_bytes());
            image.extend_from_slice(&size.to_le_bytes());
            image.extend_from_slice(&string_offset.to_le_bytes());
            image.extend_from_slice(&(size as u32).to_le_bytes());
            image.extend_from_slice(&[0; 8]);
            image.extend_from_slice(&hash);
        }
        image.extend_from_slice(&string_table);
        image.extend_from_slice(&data);
        image
    }

    #[test]
    fn hashes_verify_and_detect_corruption() {
        let image = build_hfs(&[("update", b"aaaa" as &[u8]), ("secure", b"bbbb")]);
        let fs = HashedFileSystem::new(VecStorage::new(image.clone())).unwrap();
        assert_eq!(
            fs.verify_all().unwrap(),
            vec![("update".to_string(), true), ("secure".to_string(), true)]
        );

        // flip one byte in the hashed region of "secure"
        let mut tampered = image;
        let len = tampered.len();
        tampered[len - 1] ^= 0x01;
        let fs = HashedFileSystem::new(VecStorage::new(tampered)).unwrap();
        assert_eq!(
            fs.verify_all().unwrap(),
            vec![("update".to_string(), true), ("secure".to_string(), false)]
        );
    }

    #[test]
    fn files_read_back() {
        let image = build_hfs(&[("normal", b"hello world" as &[u8])]);
        let fs = HashedFileSystem::new(VecStorage::new(image)).unwrap();
        let file = fs.open_file("normal").unwrap();
        assert_eq!(file.storage().unwrap().read_all().unwrap(), b"hello world");
    }
}
