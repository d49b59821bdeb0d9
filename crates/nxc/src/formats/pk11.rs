use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::crypto::keyset::KeySet;
use crate::hexstring::HexData;
use crate::storage::{ReadableStorage, StorageError};

#[derive(Snafu, Debug)]
pub enum Pk11Error {
    /// Package1: failed to read from the storage
    Storage { source: StorageError },
    /// Package1: failed to parse
    Parsing { source: binrw::Error },
    /// Package1: missing package1_key for key revision {revision}
    MissingKey { revision: u8 },
    /// Package1: decryption produced no PK11 magic; wrong key?
    DecryptionFailed,
    /// Package1: PK11 blob at {offset:#x}+{size:#x} lies outside the file
    Truncated { offset: u64, size: u64 },
}

const OUTER_HEADER_SIZE: usize = 0x30;
const PK11_HEADER_SIZE: usize = 0x20;

/// The plaintext outer header of a Package1 boot archive.
#[derive(Debug, Copy, Clone, BinRead)]
#[br(little)]
pub struct Pk11OuterHeader {
    /// Build timestamp identifier; the last byte selects the key revision.
    pub identifier: HexData<0x10>,
    #[br(pad_after = 0xc)]
    pub pk11_size: u32,
    pub iv: HexData<0x10>,
}

impl Pk11OuterHeader {
    pub fn key_revision(&self) -> u8 {
        self.identifier.0[0xf]
    }

    pub fn build_identifier(&self) -> String {
        String::from_utf8_lossy(
            &self.identifier.0[..self
                .identifier
                .0
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(0x10)],
        )
        .into_owned()
    }
}

/// The decrypted PK11 section header: sizes and entrypoints of the three
/// boot blobs packed behind it.
#[derive(Debug, Copy, Clone, BinRead)]
#[br(little, magic = b"PK11")]
pub struct Pk11Header {
    pub warmboot_size: u32,
    #[br(pad_after = 0x4)]
    pub warmboot_ep: u32,
    pub nx_bootloader_size: u32,
    pub nx_bootloader_ep: u32,
    pub secmon_size: u32,
    pub secmon_ep: u32,
}

/// A decoded Package1: the stage-1 loader identification plus the decrypted
/// warmboot / bootloader / secure monitor blobs.
#[derive(Debug)]
pub struct Package1 {
    pub outer: Pk11OuterHeader,
    pub header: Pk11Header,
    decrypted: Vec<u8>,
}

impl Package1 {
    pub fn new(key_set: &KeySet, storage: &(impl ReadableStorage + ?Sized)) -> Result<Self, Pk11Error> {
        let mut outer_buf = [0; OUTER_HEADER_SIZE];
        storage.read(0, &mut outer_buf).context(StorageSnafu)?;
        let outer =
            Pk11OuterHeader::read(&mut std::io::Cursor::new(&outer_buf)).context(ParsingSnafu)?;

        let offset = OUTER_HEADER_SIZE as u64;
        let size = outer.pk11_size as u64;
        if offset + size > storage.get_size() || size < PK11_HEADER_SIZE as u64 {
            return Err(Pk11Error::Truncated { offset, size });
        }

        let revision = outer.key_revision();
        let key = key_set
            .package1_key(revision)
            .map_err(|_| Pk11Error::MissingKey { revision })?;

        let mut decrypted = vec![0; size as usize];
        storage.read(offset, &mut decrypted).context(StorageSnafu)?;
        key.decrypt_cbc(&mut decrypted, &outer.iv.0);

        if &decrypted[..4] != b"PK11" {
            return Err(Pk11Error::DecryptionFailed);
        }
        let header =
            Pk11Header::read(&mut std::io::Cursor::new(&decrypted)).context(ParsingSnafu)?;

        let blobs_size = header.warmboot_size as u64
            + header.nx_bootloader_size as u64
            + header.secmon_size as u64;
        if PK11_HEADER_SIZE as u64 + blobs_size > size {
            return Err(Pk11Error::Truncated {
                offset: PK11_HEADER_SIZE as u64,
                size: blobs_size,
            });
        }

        Ok(Self {
            outer,
            header,
            decrypted,
        })
    }

    /// The three boot blobs, in their on-disk order.
    pub fn sections(&self) -> [(&'static str, &[u8]); 3] {
        let warmboot_start = PK11_HEADER_SIZE;
        let nx_bootloader_start = warmboot_start + self.header.warmboot_size as usize;
        let secmon_start = nx_bootloader_start + self.header.nx_bootloader_size as usize;

        [
            (
                "warmboot.bin",
                &self.decrypted[warmboot_start..nx_bootloader_start],
            ),
            (
                "nx_bootloader.bin",
                &self.decrypted[nx_bootloader_start..secmon_start],
            ),
            (
                "secmon.bin",
                &self.decrypted[secmon_start..secmon_start + self.header.secmon_size as usize],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    const KEY: [u8; 0x10] = [0x2c; 0x10];
    const IV: [u8; 0x10] = [0x9e; 0x10];

    fn cbc_encrypt(key: &[u8; 0x10], iv: &[u8; 0x10], buf: &mut [u8]) {
        use cipher::generic_array::GenericArray;
        use cipher::{BlockEncrypt, KeyInit};
        let crypter = aes::Aes128::new_from_slice(key).unwrap();
        let mut chain = *iv;
        for block in buf.chunks_mut(0x10) {
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            crypter.encrypt_block(GenericArray::from_mut_slice(block));
            chain.copy_from_slice(block);
        }
    }

    fn build_package1(key_revision: u8) -> Vec<u8> {
        let warmboot = [0xaa; 0x20];
        let nx_bootloader = [0xbb; 0x30];
        let secmon = [0xcc; 0x10];

        let mut pk11 = Vec::new();
        pk11.extend_from_slice(b"PK11");
        pk11.extend_from_slice(&(warmboot.len() as u32).to_le_bytes());
        pk11.extend_from_slice(&0x40010000u32.to_le_bytes()); // warmboot ep
        pk11.extend_from_slice(&[0; 4]);
        pk11.extend_from_slice(&(nx_bootloader.len() as u32).to_le_bytes());
        pk11.extend_from_slice(&0x40020000u32.to_le_bytes());
        pk11.extend_from_slice(&(secmon.len() as u32).to_le_bytes());
        pk11.extend_from_slice(&0x40030000u32.to_le_bytes());
        pk11.extend_from_slice(&warmboot);
        pk11.extend_from_slice(&nx_bootloader);
        pk11.extend_from_slice(&secmon);

        cbc_encrypt(&KEY, &IV, &mut pk11);

        let mut image = Vec::new();
        let mut identifier = *b"20180802172241\0\0";
        identifier[0xf] = key_revision;
        image.extend_from_slice(&identifier);
        image.extend_from_slice(&(pk11.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0; 0xc]);
        image.extend_from_slice(&IV);
        image.extend_from_slice(&pk11);
        image
    }

    fn keyset() -> KeySet {
        KeySet::from_file_contents(&format!("package1_key_00 = {}\n", hex::encode(KEY)), "")
            .unwrap()
    }

    #[test]
    fn decrypts_and_splits_the_boot_blobs() {
        let pk1 = Package1::new(&keyset(), &VecStorage::new(build_package1(0))).unwrap();

        assert_eq!(pk1.outer.build_identifier(), "20180802172241");
        let [(_, warmboot), (_, nx_bootloader), (_, secmon)] = pk1.sections();
        assert_eq!(warmboot, &[0xaa; 0x20]);
        assert_eq!(nx_bootloader, &[0xbb; 0x30]);
        assert_eq!(secmon, &[0xcc; 0x10]);
    }

    #[test]
    fn missing_key_revision_is_reported() {
        assert!(matches!(
            Package1::new(&keyset(), &VecStorage::new(build_package1(3))),
            Err(Pk11Error::MissingKey { revision: 3 })
        ));
    }

    #[test]
    fn wrong_key_fails_the_magic_check() {
        let keys = KeySet::from_file_contents(
            &format!("package1_key_00 = {}\n", hex::encode([0u8; 0x10])),
            "",
        )
        .unwrap();
        assert!(matches!(
            Package1::new(&keys, &VecStorage::new(build_package1(0))),
            Err(Pk11Error::DecryptionFailed)
        ));
    }
}
