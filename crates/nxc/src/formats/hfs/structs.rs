use crate::hexstring::HexData;
use binrw::{BinRead, BinWrite};

pub const HFS_HEADER_SIZE: u64 = 0x10;
pub const HFS_ENTRY_SIZE: u64 = 0x40;

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"HFS0")]
pub struct HfsHeader {
    pub file_count: u32,
    #[brw(pad_after = 0x4)]
    pub string_table_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct HfsFileEntry {
    pub offset: u64,
    pub size: u64,
    pub string_offset: u32,
    /// Length of the prefix of the file data covered by `hash`.
    pub hashed_size: u32,
    #[brw(pad_before = 0x8)]
    pub hash: HexData<0x20>,
}
