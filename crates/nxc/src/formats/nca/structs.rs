use crate::crypto::keyset::KeyAreaKeyIndex;
use crate::crypto::{EncryptedAesKey, EncryptedAesXtsKey};
use crate::hexstring::HexData;
use crate::ids::{RightsId, TitleId};
use binrw::{BinRead, BinWrite};
use std::fmt::Debug;

/// A media unit, the granularity of all section offsets.
pub const MEDIA_UNIT_SIZE: u64 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum DistributionType {
    Download,
    GameCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaEncryptionType {
    Auto,
    None,
    Xts,
    AesCtr,
    /// AES-CTR with per-range counters; the crypto of a BKTR patch section.
    AesCtrEx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaHashType {
    Auto,
    None,
    Sha256,
    Ivfc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaFormatType {
    Romfs,
    Pfs0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaSignature(pub HexData<0x100>);

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub enum NcaMagic {
    #[brw(magic = b"NCA0")]
    Nca0,
    #[brw(magic = b"NCA1")]
    Nca1,
    #[brw(magic = b"NCA2")]
    Nca2,
    #[brw(magic = b"NCA3")]
    Nca3,
}

/// Section offset stored in media units.
#[derive(Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SectionTableOffset(u32);

impl From<SectionTableOffset> for u64 {
    fn from(v: SectionTableOffset) -> Self {
        v.0 as u64 * MEDIA_UNIT_SIZE
    }
}

impl From<u64> for SectionTableOffset {
    fn from(v: u64) -> Self {
        SectionTableOffset((v / MEDIA_UNIT_SIZE).try_into().unwrap())
    }
}

impl Debug for SectionTableOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0 as u64 * MEDIA_UNIT_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct SectionTableEntry {
    pub start: SectionTableOffset,
    pub end: SectionTableOffset,
    #[brw(pad_after = 0x7)]
    #[br(parse_with = crate::brw_utils::read_bool)]
    #[bw(write_with = crate::brw_utils::write_bool)]
    pub is_enabled: bool,
}

impl SectionTableEntry {
    pub fn size(&self) -> u64 {
        (self.end.0 - self.start.0) as u64 * MEDIA_UNIT_SIZE
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn matches(&self, data: &[u8]) -> bool {
        crate::crypto::sha256(data) == self.0 .0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub struct NcaKeyArea {
    pub encrypted_xts_key: EncryptedAesXtsKey,
    pub encrypted_ctr_key: EncryptedAesKey,
    pub encrypted_ctr_ex_key: EncryptedAesKey,
    pub encrypted_ctr_hw_key: EncryptedAesKey,
    pub unused: HexData<0xb0>,
}

/// NCA header, corresponding to the first 0x400 bytes of the decrypted NCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaHeader {
    pub fixed_key_signature: NcaSignature,
    pub npdm_signature: NcaSignature,
    pub magic: NcaMagic,
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation_1: u8,
    pub key_area_key_index: KeyAreaKeyIndex,
    pub nca_size: u64,
    pub title_id: TitleId,
    pub content_index: u32,
    pub sdk_version: u32,
    #[brw(pad_after = 0xf)]
    pub key_generation_2: u8,
    pub rights_id: RightsId,
    pub section_table: [SectionTableEntry; 4],
    pub fs_header_hashes: [Sha256Hash; 4],
    pub key_area: NcaKeyArea,
}

impl NcaHeader {
    /// The effective master key revision: the larger of the two generation
    /// fields, shifted so that generations 0 and 1 share master_key_00.
    pub fn key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation_1, self.key_generation_2).saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256IntegrityInfoLevel {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256IntegrityInfo {
    pub master_hash: Sha256Hash,
    pub block_size: u32,
    pub level_count: u32,
    pub level_info: [Sha256IntegrityInfoLevel; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct IvfcIntegrityInfoLevel {
    pub offset: u64,
    pub size: u64,
    /// log2 of the block size
    #[brw(pad_after = 4)]
    pub block_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(magic = b"IVFC")]
pub struct IvfcIntegrityInfo {
    pub version: u32,
    pub master_hash_size: u32,
    pub level_count: u32,
    pub level_info: [IvfcIntegrityInfoLevel; 6],
    pub salt_source: HexData<0x20>,
    pub master_hash: HexData<0x38>, // this is the max size of the hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(import(hash_type: NcaHashType))]
pub enum IntegrityInfo {
    #[br(pre_assert(hash_type == NcaHashType::None))]
    None,
    #[br(pre_assert(hash_type == NcaHashType::Sha256))]
    Sha256(Sha256IntegrityInfo),
    #[br(pre_assert(hash_type == NcaHashType::Ivfc))]
    Ivfc(IvfcIntegrityInfo),
}

/// Locations of the BKTR relocation and subsection trees inside a patch
/// section. All-zero in non-patch sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct PatchInfo {
    pub relocation_tree_offset: u64,
    pub relocation_tree_size: u64,
    pub relocation_tree_header: HexData<0x10>,
    pub subsection_tree_offset: u64,
    pub subsection_tree_size: u64,
    pub subsection_tree_header: HexData<0x10>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub format_type: NcaFormatType,
    pub hash_type: NcaHashType,
    pub encryption_type: NcaEncryptionType,

    #[brw(pad_before = 0x3)]
    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xf8)]
    pub integrity_info: IntegrityInfo,

    #[brw(pad_size_to = 0x40)]
    pub patch_info: PatchInfo,

    /// Upper 8 bytes of the section's CTR nonce.
    #[brw(pad_after = 0xb8)]
    pub upper_counter: u64,
}

impl NcaFsHeader {
    pub fn is_patch_section(&self) -> bool {
        self.patch_info.relocation_tree_size != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinWrite;
    use std::io::Cursor;

    #[test]
    fn header_layout_is_0x400() {
        let header = NcaHeader {
            fixed_key_signature: NcaSignature(HexData([0; 0x100])),
            npdm_signature: NcaSignature(HexData([0; 0x100])),
            magic: NcaMagic::Nca3,
            distribution_type: DistributionType::Download,
            content_type: NcaContentType::Program,
            key_generation_1: 0,
            key_area_key_index: KeyAreaKeyIndex::Application,
            nca_size: 0,
            title_id: crate::ids::TitleId(0),
            content_index: 0,
            sdk_version: 0,
            key_generation_2: 0,
            rights_id: "00000000000000000000000000000000".parse().unwrap(),
            section_table: [SectionTableEntry {
                start: 0.into(),
                end: 0.into(),
                is_enabled: false,
            }; 4],
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area: NcaKeyArea {
                encrypted_xts_key: EncryptedAesXtsKey(HexData([0; 0x20])),
                encrypted_ctr_key: EncryptedAesKey(HexData([0; 0x10])),
                encrypted_ctr_ex_key: EncryptedAesKey(HexData([0; 0x10])),
                encrypted_ctr_hw_key: EncryptedAesKey(HexData([0; 0x10])),
                unused: HexData([0; 0xb0]),
            },
        };

        let mut cur = Cursor::new(Vec::new());
        header.write(&mut cur).unwrap();
        assert_eq!(cur.into_inner().len(), 0x400);
    }

    #[test]
    fn fs_header_layout_is_0x200() {
        let fs_header = NcaFsHeader {
            version: 2,
            format_type: NcaFormatType::Pfs0,
            hash_type: NcaHashType::None,
            encryption_type: NcaEncryptionType::AesCtr,
            integrity_info: IntegrityInfo::None,
            patch_info: PatchInfo {
                relocation_tree_offset: 0,
                relocation_tree_size: 0,
                relocation_tree_header: HexData([0; 0x10]),
                subsection_tree_offset: 0,
                subsection_tree_size: 0,
                subsection_tree_header: HexData([0; 0x10]),
            },
            upper_counter: 0,
        };

        let mut cur = Cursor::new(Vec::new());
        fs_header.write(&mut cur).unwrap();
        assert_eq!(cur.into_inner().len(), 0x200);
    }
}
