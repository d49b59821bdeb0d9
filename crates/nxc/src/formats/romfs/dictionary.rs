use crate::formats::romfs::structs::{RomFsEntry, RomId};
use crate::storage::{ReadableStorage, ReadableStorageExt, StorageError};
use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::marker::PhantomData;

#[derive(Snafu, Debug)]
pub enum DictionaryError {
    /// RomFS: failed to parse a hash table
    BucketParsing { source: binrw::Error },
    /// RomFS: failed to read a metadata table
    Table { source: StorageError },
    /// RomFS: hash table has no buckets
    Empty,
}

/// One (hash table, metadata table) pair of a RomFS.
///
/// The hash table is a bucket array of entry offsets; entries chain through
/// their `next` link on collision. Keys are (parent directory, name).
#[derive(Debug)]
pub struct RomFsDictionary<T> {
    buckets: Vec<RomId>,
    entries: Vec<u8>,
    phantom: PhantomData<T>,
}

impl<T> RomFsDictionary<T>
where
    T: for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + 'static,
{
    pub fn new(buckets: Vec<RomId>, entries: Vec<u8>) -> Result<Self, DictionaryError> {
        if buckets.is_empty() {
            return Err(DictionaryError::Empty);
        }
        Ok(Self {
            buckets,
            entries,
            phantom: PhantomData,
        })
    }

    pub fn from_storage(
        buckets: impl ReadableStorage,
        entries: impl ReadableStorage,
    ) -> Result<Self, DictionaryError> {
        #[derive(BinRead)]
        #[br(little)]
        struct Buckets(#[br(parse_with = binrw::helpers::until_eof)] Vec<RomId>);

        let buckets = Buckets::read(&mut buckets.buf_read())
            .context(BucketParsingSnafu)?
            .0;
        let entries = entries.read_all().context(TableSnafu)?;

        Self::new(buckets, entries)
    }

    pub fn get_id_from_key(&self, key: RomEntryKey) -> Option<RomId> {
        let hash = key.hash();
        let index = hash as usize % self.buckets.len();
        let mut id = self.buckets[index];

        while id.is_some() {
            let (name, entry) = self.get_entry_by_id(id);

            if entry.parent == key.parent && name == key.name {
                return Some(id);
            }

            id = entry.next;
        }

        None
    }

    pub fn get_entry_by_key(&self, key: RomEntryKey) -> Option<(&str, RomFsEntry<T>)> {
        let id = self.get_id_from_key(key)?;

        Some(self.get_entry_by_id(id))
    }

    pub fn get_entry_by_id(&self, id: RomId) -> (&str, RomFsEntry<T>) {
        assert!(id.is_some());

        let mut cur = std::io::Cursor::new(&self.entries);
        cur.set_position(id.0 as u64);

        let entry = RomFsEntry::read(&mut cur).expect("Malformed RomFS metadata table entry");

        let key = &self.entries[cur.position() as usize..][..entry.key_length as usize];

        let key = std::str::from_utf8(key).expect("Invalid UTF-8 in RomFS dictionary");

        (key, entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RomEntryKey<'a> {
    pub name: &'a str,
    pub parent: RomId,
}

impl<'a> RomEntryKey<'a> {
    pub fn hash(&self) -> u32 {
        let mut hash = 123456789u32 ^ self.parent.0 as u32;

        for c in self.name.bytes() {
            hash = (c as u32) ^ ((hash << 27) | (hash >> 5));
        }

        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_mixes_parent_and_name() {
        let a = RomEntryKey {
            name: "file",
            parent: RomId(0),
        };
        let b = RomEntryKey {
            name: "file",
            parent: RomId(0x18),
        };
        let c = RomEntryKey {
            name: "elif",
            parent: RomId(0),
        };
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash(), a.hash());
    }
}
