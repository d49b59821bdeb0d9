mod structs;

use binrw::BinRead;
use enum_map::{Enum, EnumMap};
use snafu::{ResultExt, Snafu};

use crate::filesystem::{ReadableFile, ReadableFileSystem};
use crate::formats::hfs::{HashedFileSystem, HfsParseError};
use crate::formats::pfs::FileStorage;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SliceStorageError, StorageError, StorageIo,
};

pub use structs::{RomSize, XciHeader, CARD_HEADER_OFFSET};

#[derive(Snafu, Debug)]
pub enum XciError {
    /// XCI: failed to read from the storage
    Storage { source: StorageError },
    /// XCI: failed to parse the card header
    Parsing { source: binrw::Error },
    /// XCI: root partition lies outside the image
    RootPartitionBounds { source: SliceStorageError },
    /// XCI: failed to parse the {name} HFS0 partition
    Partition {
        name: String,
        source: HfsParseError,
    },
    /// XCI: could not open the {name} partition: {message}
    PartitionOpen { name: String, message: String },
}

/// The named sub-partitions a gamecard's root HFS0 may carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Enum)]
pub enum XciPartitionType {
    Update,
    Normal,
    Secure,
    Logo,
}

impl XciPartitionType {
    pub const ALL: [XciPartitionType; 4] = [
        XciPartitionType::Update,
        XciPartitionType::Normal,
        XciPartitionType::Secure,
        XciPartitionType::Logo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            XciPartitionType::Update => "update",
            XciPartitionType::Normal => "normal",
            XciPartitionType::Secure => "secure",
            XciPartitionType::Logo => "logo",
        }
    }
}

/// The root HFS0 sits in a window of the card image; each sub-partition is
/// a file of the root decoded as a further HFS0.
pub type RootPartition<S> = HashedFileSystem<FileStorage<S>>;
pub type XciPartition<S> = HashedFileSystem<FileStorage<FileStorage<S>>>;

/// A gamecard image: a card header, a root HFS0, and HFS0 sub-partitions
/// (typically full of NCAs).
pub struct Xci<S: ReadableStorage> {
    header: XciHeader,
    root: RootPartition<S>,
    root_header_hash_ok: bool,
}

impl<S: ReadableStorage> Xci<S> {
    pub fn new(storage: S) -> Result<Self, XciError> {
        let storage = storage.shared();

        let mut io = StorageIo::new(storage.clone());
        std::io::Seek::seek(&mut io, std::io::SeekFrom::Start(CARD_HEADER_OFFSET))
            .map_err(|e| XciError::Storage {
                source: StorageError::Io {
                    source: e,
                    operation: "seek",
                },
            })?;
        let header = XciHeader::read(&mut io).context(ParsingSnafu)?;

        // the card header stores a hash over the root HFS0's header region
        let mut root_header = vec![0; header.root_partition_header_size as usize];
        storage
            .read(header.root_partition_offset, &mut root_header)
            .context(StorageSnafu)?;
        let root_header_hash_ok = header.root_partition_header_hash.matches(&root_header);
        if !root_header_hash_ok {
            tracing::warn!("XCI root partition header hash mismatch");
        }

        let root_size = storage.get_size() - header.root_partition_offset;
        let root = HashedFileSystem::new(
            storage
                .clone()
                .slice(header.root_partition_offset, root_size)
                .context(RootPartitionBoundsSnafu)?,
        )
        .map_err(|source| XciError::Partition {
            name: "root".to_string(),
            source,
        })?;

        Ok(Self {
            header,
            root,
            root_header_hash_ok,
        })
    }

    pub fn header(&self) -> &XciHeader {
        &self.header
    }

    pub fn root(&self) -> &RootPartition<S> {
        &self.root
    }

    pub fn root_header_hash_ok(&self) -> bool {
        self.root_header_hash_ok
    }

    /// Opens one named sub-partition, if the root HFS0 has it.
    pub fn partition(
        &self,
        ty: XciPartitionType,
    ) -> Option<Result<XciPartition<S>, XciError>> {
        let file = self.root.open_file(ty.name())?;

        Some(
            file.storage()
                .map_err(|source| XciError::PartitionOpen {
                    name: ty.name().to_string(),
                    message: source.to_string(),
                })
                .and_then(|storage| {
                    HashedFileSystem::new(storage).map_err(|source| XciError::Partition {
                        name: ty.name().to_string(),
                        source,
                    })
                }),
        )
    }

    /// Every present sub-partition, keyed by type.
    pub fn partitions(&self) -> Result<EnumMap<XciPartitionType, Option<XciPartition<S>>>, XciError> {
        let mut map = EnumMap::default();
        for ty in XciPartitionType::ALL {
            map[ty] = self.partition(ty).transpose()?;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use crate::extract::{extract_filesystem, VecSink};
    use crate::formats::hfs::tests::build_hfs;
    use crate::storage::VecStorage;

    fn build_xci(partitions: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let parts: Vec<(&str, &[u8])> = partitions
            .iter()
            .map(|(name, image)| (*name, image.as_slice()))
            .collect();
        let root = build_hfs(&parts);

        let root_offset = 0x2000u64;
        // the stored hash covers the root HFS0 header region; hash the
        // whole table area
        let root_header_size =
            0x10 + parts.len() as u64 * 0x40 + parts.iter().map(|(n, _)| n.len() as u64 + 1).sum::<u64>();

        let mut image = vec![0u8; root_offset as usize];
        image.extend_from_slice(&root);

        // card header at 0x1100
        let mut header = Vec::new();
        header.extend_from_slice(b"HEAD");
        header.extend_from_slice(&0u32.to_le_bytes()); // rom area start
        header.extend_from_slice(&0xffffffffu32.to_le_bytes()); // backup area
        header.push(0); // key index
        header.push(0xfa); // rom size: 1 GB
        header.push(0); // version
        header.push(0); // flags
        header.extend_from_slice(&0x1122334455667788u64.to_le_bytes()); // package id
        header.extend_from_slice(&0u32.to_le_bytes()); // valid data end
        header.extend_from_slice(&[0; 4]); // reserved
        header.extend_from_slice(&[0; 0x10]); // iv
        header.extend_from_slice(&root_offset.to_le_bytes());
        header.extend_from_slice(&root_header_size.to_le_bytes());
        header.extend_from_slice(&sha256(&root[..root_header_size as usize]));
        header.extend_from_slice(&[0; 0x20]); // initial data hash
        header.extend_from_slice(&1u32.to_le_bytes()); // sel sec
        header.extend_from_slice(&2u32.to_le_bytes()); // sel t1 key
        header.extend_from_slice(&0u32.to_le_bytes()); // sel key
        header.extend_from_slice(&0u32.to_le_bytes()); // lim area
        header.extend_from_slice(&[0; 0x70]); // encrypted data

        image[CARD_HEADER_OFFSET as usize..CARD_HEADER_OFFSET as usize + header.len()]
            .copy_from_slice(&header);
        image
    }

    #[test]
    fn finds_partitions_and_their_files() {
        let update = build_hfs(&[("u.nca", b"update-nca" as &[u8])]);
        let normal = build_hfs(&[("n.nca", b"normal-nca" as &[u8])]);
        let secure = build_hfs(&[("s.nca", b"secure-nca" as &[u8])]);
        let image = build_xci(&[
            ("update", update),
            ("normal", normal),
            ("secure", secure),
        ]);

        let xci = Xci::new(VecStorage::new(image)).unwrap();
        assert!(xci.root_header_hash_ok());
        assert_eq!(xci.header().rom_size, RomSize::Size1Gb);
        assert_eq!(xci.root().file_count(), 3);

        let secure = xci.partition(XciPartitionType::Secure).unwrap().unwrap();
        let mut sink = VecSink::default();
        extract_filesystem(&secure, &mut sink).unwrap();
        assert_eq!(sink.files, vec![("s.nca".to_string(), b"secure-nca".to_vec())]);

        assert!(xci.partition(XciPartitionType::Logo).is_none());
    }

    #[test]
    fn detects_root_header_tampering() {
        let update = build_hfs(&[("u.nca", b"update-nca" as &[u8])]);
        let mut image = build_xci(&[("update", update)]);
        // flip a byte inside the root HFS0 file table
        image[0x2000 + 0x18] ^= 1;

        let xci = Xci::new(VecStorage::new(image)).unwrap();
        assert!(!xci.root_header_hash_ok());
    }
}
