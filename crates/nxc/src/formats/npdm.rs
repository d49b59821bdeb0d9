use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::hexstring::HexData;
use crate::ids::TitleId;
use crate::storage::{ReadableStorage, StorageError};

#[derive(Snafu, Debug)]
pub enum NpdmError {
    /// NPDM: failed to parse
    Parsing { source: binrw::Error },
    /// NPDM: failed to read from the storage
    Storage { source: StorageError },
    /// NPDM: {name} region at {offset:#x}+{size:#x} lies outside the file
    Truncated { name: &'static str, offset: u32, size: u32 },
}

fn null_padded_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The `META` header of a program descriptor.
#[derive(Debug, Copy, Clone, BinRead)]
#[br(little, magic = b"META")]
pub struct MetaHeader {
    #[br(pad_before = 0x8)]
    pub mmu_flags: u8,
    #[br(pad_before = 0x1)]
    pub main_thread_priority: u8,
    pub main_thread_core: u8,
    #[br(pad_before = 0x4)]
    pub system_resource_size: u32,
    pub version: u32,
    pub main_thread_stack_size: u32,
    pub title_name_raw: HexData<0x10>,
    pub product_code_raw: HexData<0x10>,
    #[br(pad_before = 0x30)]
    pub aci0_offset: u32,
    pub aci0_size: u32,
    pub acid_offset: u32,
    pub acid_size: u32,
}

#[derive(Debug, Copy, Clone, BinRead)]
#[br(little, magic = b"ACI0")]
pub struct Aci0 {
    #[br(pad_before = 0xc)]
    pub title_id: TitleId,
}

/// The signed access control descriptor. The RSA signature and embedded
/// public key precede the magic.
#[derive(Debug, Copy, Clone, BinRead)]
#[br(little)]
pub struct Acid {
    pub signature: HexData<0x100>,
    pub modulus: HexData<0x100>,
    #[br(magic = b"ACID")]
    pub size: u32,
    pub flags: u32,
    #[br(pad_before = 0x4)]
    pub title_id_range_min: TitleId,
    pub title_id_range_max: TitleId,
}

/// A parsed NPDM (program security metadata, `main.npdm` in an ExeFS).
#[derive(Debug)]
pub struct Npdm {
    pub header: MetaHeader,
    pub title_name: String,
    pub product_code: String,
    pub aci0: Aci0,
    pub acid: Acid,
    /// Total bytes the file occupies: the far end of ACI0 or ACID.
    pub total_size: u64,
}

impl Npdm {
    pub fn new(storage: &(impl ReadableStorage + ?Sized)) -> Result<Self, NpdmError> {
        let mut header_buf = [0; 0x80];
        storage.read(0, &mut header_buf).context(StorageSnafu)?;
        let header =
            MetaHeader::read(&mut std::io::Cursor::new(&header_buf)).context(ParsingSnafu)?;

        let region = |name: &'static str, offset: u32, size: u32| -> Result<Vec<u8>, NpdmError> {
            if offset as u64 + size as u64 > storage.get_size() {
                return Err(NpdmError::Truncated { name, offset, size });
            }
            let mut buf = vec![0; size as usize];
            storage.read(offset as u64, &mut buf).context(StorageSnafu)?;
            Ok(buf)
        };

        let aci0_buf = region("ACI0", header.aci0_offset, header.aci0_size)?;
        let aci0 = Aci0::read(&mut std::io::Cursor::new(&aci0_buf)).context(ParsingSnafu)?;

        let acid_buf = region("ACID", header.acid_offset, header.acid_size)?;
        let acid = Acid::read(&mut std::io::Cursor::new(&acid_buf)).context(ParsingSnafu)?;

        let total_size = std::cmp::max(
            header.aci0_offset as u64 + header.aci0_size as u64,
            header.acid_offset as u64 + header.acid_size as u64,
        );

        Ok(Self {
            title_name: null_padded_string(&header.title_name_raw.0),
            product_code: null_padded_string(&header.product_code_raw.0),
            header,
            aci0,
            acid,
            total_size,
        })
    }

    pub fn is_64bit(&self) -> bool {
        self.header.mmu_flags & 0x01 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    fn build_npdm() -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(b"META");
        image.extend_from_slice(&[0; 8]);
        image.push(0x01); // mmu flags: 64-bit
        image.push(0);
        image.push(44); // main thread priority
        image.push(2); // main thread core
        image.extend_from_slice(&[0; 4]);
        image.extend_from_slice(&0u32.to_le_bytes()); // system resource size
        image.extend_from_slice(&0x00010203u32.to_le_bytes()); // version
        image.extend_from_slice(&0x10000u32.to_le_bytes()); // stack size
        image.extend_from_slice(b"Application\0\0\0\0\0"); // title name
        image.extend_from_slice(&[0; 0x10]); // product code
        image.extend_from_slice(&[0; 0x30]);
        image.extend_from_slice(&0x400u32.to_le_bytes()); // aci0 offset
        image.extend_from_slice(&0x400u32.to_le_bytes()); // aci0 size
        image.extend_from_slice(&0x800u32.to_le_bytes()); // acid offset
        image.extend_from_slice(&0x200u32.to_le_bytes()); // acid size
        image.resize(0x400, 0);

        // ACI0
        image.extend_from_slice(b"ACI0");
        image.extend_from_slice(&[0; 0xc]);
        image.extend_from_slice(&0x0100aabbccdd0000u64.to_le_bytes());
        image.resize(0x800, 0);

        // ACID: sig + pubkey + header
        image.extend_from_slice(&[0x5a; 0x100]);
        image.extend_from_slice(&[0xa5; 0x100]);
        image.extend_from_slice(b"ACID");
        image.extend_from_slice(&0x200u32.to_le_bytes()); // size
        image.extend_from_slice(&1u32.to_le_bytes()); // flags
        image.extend_from_slice(&[0; 4]); // reserved
        image.extend_from_slice(&0x0100aabbccdd0000u64.to_le_bytes());
        image.extend_from_slice(&0x0100aabbccddffffu64.to_le_bytes());
        image.resize(0xa00, 0);
        image
    }

    #[test]
    fn parses_the_meta_chain() {
        let npdm = Npdm::new(&VecStorage::new(build_npdm())).unwrap();

        assert!(npdm.is_64bit());
        assert_eq!(npdm.title_name, "Application");
        assert_eq!(npdm.header.main_thread_priority, 44);
        assert_eq!(npdm.aci0.title_id.0, 0x0100aabbccdd0000);
        assert_eq!(npdm.acid.title_id_range_max.0, 0x0100aabbccddffff);
        // total size is the far end of the ACID region
        assert_eq!(npdm.total_size, 0xa00);
    }

    #[test]
    fn truncated_regions_are_rejected() {
        let mut image = build_npdm();
        image.truncate(0x900);
        assert!(matches!(
            Npdm::new(&VecStorage::new(image)),
            Err(NpdmError::Truncated { name: "ACID", .. })
        ));
    }
}
