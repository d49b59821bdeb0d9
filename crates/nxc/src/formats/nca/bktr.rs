use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::crypto::AesKey;
use crate::storage::{ReadableStorage, StorageError};

const BUCKET_SIZE: u64 = 0x4000;

#[derive(Snafu, Debug)]
pub enum BktrError {
    /// BKTR: bucket tree header has a bad magic
    BadMagic,
    /// BKTR: failed to parse a bucket tree
    Parsing { source: binrw::Error },
    /// BKTR: failed to read a bucket tree
    Storage { source: StorageError },
    /// BKTR: table does not cover the section contiguously
    #[snafu(display("BKTR: entry at {:#x} breaks contiguous coverage (expected start {:#x})", found, expected))]
    Coverage { expected: u64, found: u64 },
    /// BKTR: table is empty
    EmptyTable,
}

/// The 0x10-byte header copied into the FS header's patch info.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead)]
#[br(little, magic = b"BKTR")]
pub struct BucketTreeHeader {
    pub version: u32,
    pub num_entries: u32,
}

impl BucketTreeHeader {
    pub fn parse(raw: &[u8; 0x10]) -> Result<Self, BktrError> {
        Self::read(&mut std::io::Cursor::new(raw)).map_err(|e| match e {
            binrw::Error::BadMagic { .. } => BktrError::BadMagic,
            e => BktrError::Parsing { source: e },
        })
    }
}

#[derive(Debug, Copy, Clone, BinRead)]
#[br(little)]
struct BucketBlockHeader {
    #[br(pad_before = 0x4)]
    num_buckets: u32,
    total_size: u64,
}

#[derive(Debug, Copy, Clone, BinRead)]
#[br(little)]
struct BucketHeader {
    #[br(pad_before = 0x4)]
    num_entries: u32,
    _end_offset: u64,
}

/// One segment of the relocation table: bytes at `virt_offset` and up come
/// from `phys_offset` in either the patch or the base section.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct RelocationEntry {
    pub virt_offset: u64,
    pub phys_offset: u64,
    #[br(map = |v: u32| v != 0)]
    pub is_from_patch: bool,
}

/// One segment of the subsection table: bytes at `phys_offset` and up use
/// `ctr_val` as the middle third of their CTR nonce.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct SubsectionEntry {
    pub phys_offset: u64,
    #[br(pad_before = 0x4)]
    pub ctr_val: u32,
}

/// A bucket tree flattened into a sorted segment list.
///
/// Segment `i` covers `[entries[i].offset(), entries[i+1].offset())`, the
/// last one ending at `end_offset`; together they cover the whole section
/// with no gaps or overlaps.
#[derive(Debug)]
pub struct SegmentTable<E> {
    entries: Vec<E>,
    end_offset: u64,
}

pub type RelocationTable = SegmentTable<RelocationEntry>;
pub type SubsectionTable = SegmentTable<SubsectionEntry>;

trait Segment {
    /// On-disk entry size; not the in-memory one.
    const DISK_SIZE: u64;

    fn start(&self) -> u64;
}

impl Segment for RelocationEntry {
    const DISK_SIZE: u64 = 0x14;

    fn start(&self) -> u64 {
        self.virt_offset
    }
}

impl Segment for SubsectionEntry {
    const DISK_SIZE: u64 = 0x10;

    fn start(&self) -> u64 {
        self.phys_offset
    }
}

impl<E: Segment + Copy + for<'a> BinRead<Args<'a> = ()>> SegmentTable<E> {
    /// Parses a bucket tree from its (already decrypted) on-disk region:
    /// a bucket index block followed by 0x4000-byte buckets of entries.
    pub(crate) fn parse(storage: &(impl ReadableStorage + ?Sized)) -> Result<Self, BktrError> {
        let mut header_buf = [0; 0x10];
        storage.read(0, &mut header_buf).context(StorageSnafu)?;
        let block = BucketBlockHeader::read(&mut std::io::Cursor::new(&header_buf))
            .context(ParsingSnafu)?;

        let mut entries = Vec::new();
        for bucket_index in 0..block.num_buckets as u64 {
            let bucket_offset = BUCKET_SIZE * (1 + bucket_index);

            let mut bucket_header_buf = [0; 0x10];
            storage
                .read(bucket_offset, &mut bucket_header_buf)
                .context(StorageSnafu)?;
            let bucket = BucketHeader::read(&mut std::io::Cursor::new(&bucket_header_buf))
                .context(ParsingSnafu)?;

            let mut entries_buf =
                vec![0; (bucket.num_entries as u64 * E::DISK_SIZE) as usize];
            storage
                .read(bucket_offset + 0x10, &mut entries_buf)
                .context(StorageSnafu)?;

            let mut cur = std::io::Cursor::new(&entries_buf);
            for _ in 0..bucket.num_entries {
                entries.push(E::read_le(&mut cur).context(ParsingSnafu)?);
            }
        }

        Self::from_entries(entries, block.total_size)
    }

    pub(crate) fn from_entries(entries: Vec<E>, end_offset: u64) -> Result<Self, BktrError> {
        if entries.is_empty() {
            return Err(BktrError::EmptyTable);
        }
        // exact coverage of [0, end_offset): the first segment starts at
        // zero, starts strictly increase (each segment ends where the next
        // begins), and no segment starts at or past the end
        if entries[0].start() != 0 {
            return Err(BktrError::Coverage {
                expected: 0,
                found: entries[0].start(),
            });
        }
        for pair in entries.windows(2) {
            if pair[1].start() <= pair[0].start() {
                return Err(BktrError::Coverage {
                    expected: pair[0].start() + 1,
                    found: pair[1].start(),
                });
            }
        }
        if let Some(last) = entries.last() {
            if last.start() >= end_offset {
                return Err(BktrError::Coverage {
                    expected: end_offset,
                    found: last.start(),
                });
            }
        }

        Ok(Self {
            entries,
            end_offset,
        })
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// The segment containing `offset` and the offset its coverage ends at.
    fn lookup(&self, offset: u64) -> (&E, u64) {
        debug_assert!(offset < self.end_offset);

        let index = match self
            .entries
            .binary_search_by_key(&offset, |entry| entry.start())
        {
            Ok(index) => index,
            Err(insertion_point) => insertion_point - 1,
        };

        let end = self
            .entries
            .get(index + 1)
            .map(|next| next.start())
            .unwrap_or(self.end_offset);

        (&self.entries[index], end)
    }
}

/// AES-CTR view over the patch side of a BKTR section, where every
/// subsection has its own counter: bytes `[4..8)` of the nonce come from the
/// subsection's `ctr_val`, the low 8 bytes from the absolute file offset.
#[derive(Debug)]
pub struct AesCtrExStorage<S: ReadableStorage> {
    storage: S,
    key: AesKey,
    nonce_hi: [u8; 4],
    section_base: u64,
    subsections: SubsectionTable,
}

impl<S: ReadableStorage> AesCtrExStorage<S> {
    /// `storage` is the raw (still encrypted) section slice, `section_base`
    /// its absolute offset within the NCA file.
    pub fn new(
        storage: S,
        key: AesKey,
        upper_counter: u64,
        section_base: u64,
        subsections: SubsectionTable,
    ) -> Self {
        Self {
            storage,
            key,
            nonce_hi: upper_counter.to_be_bytes()[..4].try_into().unwrap(),
            section_base,
            subsections,
        }
    }

    fn decrypt_span(&self, offset: u64, ctr_val: u32, buf: &mut [u8]) {
        let file_offset = self.section_base + offset;

        let mut ctr = [0; 0x10];
        ctr[0..4].copy_from_slice(&self.nonce_hi);
        ctr[4..8].copy_from_slice(&ctr_val.to_be_bytes());
        ctr[8..].copy_from_slice(&(file_offset >> 4).to_be_bytes());

        self.key
            .decrypt_ctr_unaligned(buf, &ctr, (file_offset & 0xf) as usize);
    }
}

impl<S: ReadableStorage> ReadableStorage for AesCtrExStorage<S> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        while !buf.is_empty() {
            let (subsection, end) = self.subsections.lookup(offset);
            let span = std::cmp::min((end - offset) as usize, buf.len());

            self.storage.read(offset, &mut buf[..span])?;
            self.decrypt_span(offset, subsection.ctr_val, &mut buf[..span]);

            offset += span as u64;
            buf = &mut buf[span..];
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

/// The patched RomFS view of an update NCA: relocation segments dispatch
/// every read either to the base section or to the CTR-Ex patch data.
///
/// The base view is only borrowed structurally: the overlay never owns the
/// base NCA, the driver keeps it alive.
#[derive(Debug)]
pub struct BktrStorage<B: ReadableStorage, S: ReadableStorage> {
    relocations: RelocationTable,
    base: B,
    patched: AesCtrExStorage<S>,
}

impl<B: ReadableStorage, S: ReadableStorage> BktrStorage<B, S> {
    pub fn new(relocations: RelocationTable, base: B, patched: AesCtrExStorage<S>) -> Self {
        Self {
            relocations,
            base,
            patched,
        }
    }
}

impl<B: ReadableStorage, S: ReadableStorage> ReadableStorage for BktrStorage<B, S> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.get_size() {
            return Err(StorageError::OutOfBounds {});
        }

        while !buf.is_empty() {
            let (relocation, end) = self.relocations.lookup(offset);
            let span = std::cmp::min((end - offset) as usize, buf.len());
            let phys = relocation.phys_offset + (offset - relocation.virt_offset);

            if relocation.is_from_patch {
                self.patched.read(phys, &mut buf[..span])?;
            } else {
                self.base.read(phys, &mut buf[..span])?;
            }

            offset += span as u64;
            buf = &mut buf[span..];
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.relocations.end_offset()
    }
}

/// Serializes a segment table back into bucket-tree bytes. Only complete
/// enough for the synthetic images the tests build.
#[cfg(test)]
pub(crate) fn write_bucket_tree(
    entry_writer: impl Fn(&mut Vec<u8>),
    num_entries: u32,
    total_size: u64,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&1u32.to_le_bytes()); // one bucket
    out.extend_from_slice(&total_size.to_le_bytes());
    out.resize(BUCKET_SIZE as usize, 0);

    // bucket header
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&num_entries.to_le_bytes());
    out.extend_from_slice(&total_size.to_le_bytes());
    entry_writer(&mut out);
    out.resize(2 * BUCKET_SIZE as usize, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    fn relocation_bytes(entries: &[(u64, u64, bool)], total_size: u64) -> Vec<u8> {
        write_bucket_tree(
            |out| {
                for &(virt, phys, from_patch) in entries {
                    out.extend_from_slice(&virt.to_le_bytes());
                    out.extend_from_slice(&phys.to_le_bytes());
                    out.extend_from_slice(&(from_patch as u32).to_le_bytes());
                }
            },
            entries.len() as u32,
            total_size,
        )
    }

    fn subsection_bytes(entries: &[(u64, u32)], total_size: u64) -> Vec<u8> {
        write_bucket_tree(
            |out| {
                for &(offset, ctr_val) in entries {
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(&[0; 4]);
                    out.extend_from_slice(&ctr_val.to_le_bytes());
                }
            },
            entries.len() as u32,
            total_size,
        )
    }

    #[test]
    fn parses_and_looks_up_segments() {
        let bytes = relocation_bytes(&[(0, 0, false), (0x100, 0x40, true)], 0x200);
        let table = RelocationTable::parse(&VecStorage::new(bytes)).unwrap();

        let (seg, end) = table.lookup(0);
        assert!(!seg.is_from_patch);
        assert_eq!(end, 0x100);

        let (seg, end) = table.lookup(0xff);
        assert!(!seg.is_from_patch);
        assert_eq!(end, 0x100);

        let (seg, end) = table.lookup(0x100);
        assert!(seg.is_from_patch);
        assert_eq!(seg.phys_offset, 0x40);
        assert_eq!(end, 0x200);
    }

    #[test]
    fn rejects_tables_with_coverage_gaps() {
        let bytes = relocation_bytes(&[(0x10, 0, false)], 0x200);
        assert!(matches!(
            RelocationTable::parse(&VecStorage::new(bytes)),
            Err(BktrError::Coverage { .. })
        ));

        let bytes = relocation_bytes(&[(0, 0, false), (0x300, 0, true)], 0x200);
        assert!(matches!(
            RelocationTable::parse(&VecStorage::new(bytes)),
            Err(BktrError::Coverage { .. })
        ));
    }

    #[test]
    fn header_magic_is_checked() {
        let mut raw = [0u8; 0x10];
        raw[..4].copy_from_slice(b"BKTR");
        raw[4..8].copy_from_slice(&1u32.to_le_bytes());
        raw[8..12].copy_from_slice(&5u32.to_le_bytes());
        let header = BucketTreeHeader::parse(&raw).unwrap();
        assert_eq!(header.num_entries, 5);

        raw[..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            BucketTreeHeader::parse(&raw),
            Err(BktrError::BadMagic)
        ));
    }

    #[test]
    fn romfs_decodes_through_the_overlay() {
        use crate::filesystem::{ReadableFile, ReadableFileSystem};
        use crate::formats::romfs::tests::sample_romfs;
        use crate::formats::romfs::RomFileSystem;
        use crate::storage::ReadableStorageExt;

        // the base RomFS has /a.txt = "alpha" and /sub/b.bin = "bravo!";
        // shadow a.txt's data bytes with update contents
        let base_image = sample_romfs();
        let data_offset =
            u64::from_le_bytes(base_image[0x48..0x50].try_into().unwrap());
        let total_size = base_image.len() as u64;

        let key: AesKey = "0f0e0d0c0b0a09080706050403020100".parse().unwrap();
        let upper_counter = 0x1111222233334444u64;
        let section_base = 0x1000u64;

        let mut update = b"ALPHA\0\0\0\0\0\0\0\0\0\0\0".to_vec();
        let mut ctr = [0u8; 0x10];
        ctr[0..4].copy_from_slice(&upper_counter.to_be_bytes()[..4]);
        ctr[4..8].copy_from_slice(&5u32.to_be_bytes());
        ctr[8..].copy_from_slice(&(section_base >> 4).to_be_bytes());
        key.encrypt_ctr(&mut update, &ctr);

        let subsections = SubsectionTable::from_entries(
            vec![SubsectionEntry {
                phys_offset: 0,
                ctr_val: 5,
            }],
            update.len() as u64,
        )
        .unwrap();
        let patched = AesCtrExStorage::new(
            VecStorage::new(update),
            key,
            upper_counter,
            section_base,
            subsections,
        );

        let relocations = RelocationTable::from_entries(
            vec![
                RelocationEntry {
                    virt_offset: 0,
                    phys_offset: 0,
                    is_from_patch: false,
                },
                RelocationEntry {
                    virt_offset: data_offset,
                    phys_offset: 0,
                    is_from_patch: true,
                },
                RelocationEntry {
                    virt_offset: data_offset + 5,
                    phys_offset: data_offset + 5,
                    is_from_patch: false,
                },
            ],
            total_size,
        )
        .unwrap();

        let overlay = BktrStorage::new(relocations, VecStorage::new(base_image), patched);
        let fs = RomFileSystem::new(overlay).unwrap();

        let patched_file = fs.open_file("a.txt").unwrap();
        assert_eq!(patched_file.storage().unwrap().read_all().unwrap(), b"ALPHA");

        let base_file = fs.open_file("sub/b.bin").unwrap();
        assert_eq!(base_file.storage().unwrap().read_all().unwrap(), b"bravo!");
    }

    #[test]
    fn overlay_stitches_base_and_patch_reads() {
        let key: AesKey = "a0a1a2a3a4a5a6a7a8a9aaabacadaeaf".parse().unwrap();
        let upper_counter = 0x0102030405060708u64;
        let section_base = 0x6000u64;

        // physical update section: 0x40 bytes in two subsections with
        // different counters
        let update_plain: Vec<u8> = (0..0x40u32).map(|i| i as u8).collect();
        let subsections =
            SubsectionTable::from_entries(
                vec![
                    SubsectionEntry {
                        phys_offset: 0,
                        ctr_val: 7,
                    },
                    SubsectionEntry {
                        phys_offset: 0x20,
                        ctr_val: 9,
                    },
                ],
                0x40,
            )
            .unwrap();

        // encrypt each subsection with its own nonce
        let mut update_encrypted = update_plain.clone();
        for (start, end, ctr_val) in [(0usize, 0x20usize, 7u32), (0x20, 0x40, 9)] {
            let mut ctr = [0u8; 0x10];
            ctr[0..4].copy_from_slice(&upper_counter.to_be_bytes()[..4]);
            ctr[4..8].copy_from_slice(&ctr_val.to_be_bytes());
            ctr[8..].copy_from_slice(&((section_base + start as u64) >> 4).to_be_bytes());
            key.encrypt_ctr(&mut update_encrypted[start..end], &ctr);
        }

        let patched = AesCtrExStorage::new(
            VecStorage::new(update_encrypted),
            key,
            upper_counter,
            section_base,
            subsections,
        );

        // base section: 0x40 bytes of 0xBB
        let base = VecStorage::new(vec![0xbb; 0x40]);

        // virtual layout: [0, 0x20) from base offset 0x10,
        //                 [0x20, 0x60) from patch offset 0
        let relocations = RelocationTable::from_entries(
            vec![
                RelocationEntry {
                    virt_offset: 0,
                    phys_offset: 0x10,
                    is_from_patch: false,
                },
                RelocationEntry {
                    virt_offset: 0x20,
                    phys_offset: 0,
                    is_from_patch: true,
                },
            ],
            0x60,
        )
        .unwrap();

        let overlay = BktrStorage::new(relocations, base, patched);
        assert_eq!(overlay.get_size(), 0x60);

        // one read spanning the base/patch boundary and both subsections
        let mut buf = vec![0; 0x60];
        overlay.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x20], &[0xbb; 0x20]);
        assert_eq!(&buf[0x20..], &update_plain[..]);

        // an unaligned read inside the patch side
        let mut buf = vec![0; 5];
        overlay.read(0x33, &mut buf).unwrap();
        assert_eq!(&buf, &update_plain[0x13..0x18]);
    }
}
