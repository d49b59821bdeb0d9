use crate::formats::nca::structs::Sha256Hash;
use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};

/// Absolute offset of the card header (the 0x100-byte signature precedes
/// it; the card key area and reserved regions come before that).
pub const CARD_HEADER_OFFSET: u64 = 0x1100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum RomSize {
    Size1Gb = 0xfa,
    Size2Gb = 0xf8,
    Size4Gb = 0xf0,
    Size8Gb = 0xe0,
    Size16Gb = 0xe1,
    Size32Gb = 0xe2,
}

impl RomSize {
    pub fn capacity(self) -> &'static str {
        match self {
            RomSize::Size1Gb => "1 GB",
            RomSize::Size2Gb => "2 GB",
            RomSize::Size4Gb => "4 GB",
            RomSize::Size8Gb => "8 GB",
            RomSize::Size16Gb => "16 GB",
            RomSize::Size32Gb => "32 GB",
        }
    }
}

/// The gamecard header at 0x1100. Fields inside the encrypted tail region
/// are kept as an opaque blob.
#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"HEAD")]
pub struct XciHeader {
    pub rom_area_start_page: u32,
    pub backup_area_start_page: u32,
    pub key_index: u8,
    pub rom_size: RomSize,
    pub version: u8,
    pub flags: u8,
    pub package_id: u64,
    #[brw(pad_after = 0x4)]
    pub valid_data_end_page: u32,
    pub iv: HexData<0x10>,
    /// Absolute offset of the root HFS0 header.
    pub root_partition_offset: u64,
    pub root_partition_header_size: u64,
    pub root_partition_header_hash: Sha256Hash,
    pub initial_data_hash: Sha256Hash,
    pub sel_sec: u32,
    pub sel_t1_key: u32,
    pub sel_key: u32,
    pub lim_area_page: u32,
    /// AES-128-CBC encrypted gamecard info.
    pub encrypted_data: HexData<0x70>,
}
