use binrw::{BinRead, BinWrite};

pub const PFS_HEADER_SIZE: u64 = 0x10;
pub const PFS_ENTRY_SIZE: u64 = 0x18;

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"PFS0")]
pub struct PfsHeader {
    pub file_count: u32,
    #[brw(pad_after = 0x4)]
    pub string_table_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PfsFileEntry {
    /// Offset of the file data relative to the data region (which starts
    /// right after the string table).
    pub offset: u64,
    pub size: u64,
    #[brw(pad_after = 0x4)]
    pub string_offset: u32,
}
