use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::crypto::keyset::KeySet;
use crate::crypto::pki::{SignatureStatus, TrustAnchors};
use crate::crypto::{sha256, AesKey};
use crate::hexstring::HexData;
use crate::storage::{ReadableStorage, StorageError};

#[derive(Snafu, Debug)]
pub enum Pk21Error {
    /// Package2: failed to read from the storage
    Storage { source: StorageError },
    /// Package2: failed to parse the decrypted meta
    Parsing { source: binrw::Error },
    /// Package2: no loaded package2_key decrypts the meta
    DecryptionFailed,
    /// Package2: section {index} at {offset:#x}+{size:#x} lies outside the file
    Truncated { index: usize, offset: u64, size: u64 },
}

// signature (0x100) | cmac (0x10) | ctr (0x10) | encrypted meta (0x120)
const HEADER_SIZE: usize = 0x240;
const META_OFFSET: usize = 0x120;
const SECTION_COUNT: usize = 4;

#[derive(Debug, Copy, Clone, BinRead)]
#[br(little)]
pub struct Pk21SectionEntry {
    pub offset: u32,
    pub size: u32,
    pub ctr: HexData<0x10>,
    pub hash: HexData<0x20>,
}

/// The decrypted meta region of the Package2 header.
#[derive(Debug, Copy, Clone, BinRead)]
#[br(little, magic = b"PK21")]
pub struct Pk21Meta {
    #[br(pad_after = 0x8)]
    pub version: u32,
    pub sections: [Pk21SectionEntry; SECTION_COUNT],
}

/// One decrypted Package2 payload section with its recorded hash check.
#[derive(Debug)]
pub struct Pk21Section {
    pub index: usize,
    pub data: Vec<u8>,
    pub hash_ok: bool,
}

/// A decoded Package2 boot archive.
///
/// The key generation is found by trial: each loaded `package2_key` is
/// tried against the encrypted meta until the magic appears.
#[derive(Debug)]
pub struct Package2 {
    pub meta: Pk21Meta,
    pub key_generation: u8,
    pub cmac_ok: bool,
    header: [u8; HEADER_SIZE],
    sections: Vec<Pk21Section>,
}

impl Package2 {
    pub fn new(
        key_set: &KeySet,
        storage: &(impl ReadableStorage + ?Sized),
    ) -> Result<Self, Pk21Error> {
        let mut header = [0; HEADER_SIZE];
        storage.read(0, &mut header).context(StorageSnafu)?;

        let ctr: [u8; 0x10] = header[0x110..0x120].try_into().unwrap();

        let (key_generation, key, meta_plain) = Self::find_key(key_set, &header, &ctr)
            .ok_or(Pk21Error::DecryptionFailed)?;
        let meta =
            Pk21Meta::read(&mut std::io::Cursor::new(&meta_plain)).context(ParsingSnafu)?;

        let stored_cmac: [u8; 0x10] = header[0x100..0x110].try_into().unwrap();
        let cmac_ok = key.cmac(&meta_plain) == stored_cmac;
        if !cmac_ok {
            tracing::warn!("Package2 meta CMAC mismatch");
        }

        let mut sections = Vec::new();
        for (index, entry) in meta.sections.iter().enumerate() {
            if entry.size == 0 {
                continue;
            }

            let offset = HEADER_SIZE as u64 + entry.offset as u64;
            let size = entry.size as u64;
            if offset + size > storage.get_size() {
                return Err(Pk21Error::Truncated {
                    index,
                    offset,
                    size,
                });
            }

            let mut data = vec![0; size as usize];
            storage.read(offset, &mut data).context(StorageSnafu)?;
            key.decrypt_ctr_unaligned(&mut data, &entry.ctr.0, 0);

            let hash_ok = sha256(&data) == entry.hash.0;
            if !hash_ok {
                tracing::warn!(index, "Package2 section hash mismatch");
            }

            sections.push(Pk21Section {
                index,
                data,
                hash_ok,
            });
        }

        Ok(Self {
            meta,
            key_generation,
            cmac_ok,
            header,
            sections,
        })
    }

    fn find_key(
        key_set: &KeySet,
        header: &[u8; HEADER_SIZE],
        ctr: &[u8; 0x10],
    ) -> Option<(u8, AesKey, Vec<u8>)> {
        for (generation, key) in key_set.package2_key_candidates() {
            let mut meta = header[META_OFFSET..].to_vec();
            key.decrypt_ctr(&mut meta, ctr);

            if &meta[..4] == b"PK21" {
                return Some((generation, key, meta));
            }
        }
        None
    }

    pub fn sections(&self) -> &[Pk21Section] {
        &self.sections
    }

    /// Checks the header signature over the signed tail of the header.
    pub fn verify_signature(&self, anchors: &TrustAnchors) -> SignatureStatus {
        let signature: &[u8; 0x100] = self.header[..0x100].try_into().unwrap();
        anchors.verify_package2(&self.header[0x100..], signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;

    const KEY: [u8; 0x10] = [0x3d; 0x10];
    const HEADER_CTR: [u8; 0x10] = [0x61; 0x10];

    fn build_package2(sections: &[&[u8]]) -> Vec<u8> {
        let key: AesKey = KEY.into();

        let mut meta = Vec::new();
        meta.extend_from_slice(b"PK21");
        meta.extend_from_slice(&0x0b00u32.to_le_bytes()); // version
        meta.extend_from_slice(&[0; 8]);

        let mut payload = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let mut ctr = [0u8; 0x10];
            ctr[0] = 0x70 + i as u8;

            meta.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            meta.extend_from_slice(&(section.len() as u32).to_le_bytes());
            meta.extend_from_slice(&ctr);
            meta.extend_from_slice(&sha256(section));

            let mut encrypted = section.to_vec();
            encrypted.resize((encrypted.len() + 0xf) & !0xf, 0);
            key.encrypt_ctr(&mut encrypted, &ctr);
            encrypted.truncate(section.len());
            payload.extend_from_slice(&encrypted);
        }
        for _ in sections.len()..SECTION_COUNT {
            meta.extend_from_slice(&[0; 0x38]);
        }
        meta.resize(HEADER_SIZE - META_OFFSET, 0);

        let cmac = key.cmac(&meta);

        let mut meta_encrypted = meta;
        key.encrypt_ctr(&mut meta_encrypted, &HEADER_CTR);

        let mut image = Vec::new();
        image.extend_from_slice(&[0; 0x100]); // signature
        image.extend_from_slice(&cmac);
        image.extend_from_slice(&HEADER_CTR);
        image.extend_from_slice(&meta_encrypted);
        image.extend_from_slice(&payload);
        image
    }

    fn keyset() -> KeySet {
        KeySet::from_file_contents(&format!("package2_key_01 = {}\n", hex::encode(KEY)), "")
            .unwrap()
    }

    #[test]
    fn trial_decrypts_with_the_right_generation() {
        let image = build_package2(&[b"kernel image bytes", b"ini1 process set"]);
        let pk2 = Package2::new(&keyset(), &VecStorage::new(image)).unwrap();

        assert_eq!(pk2.key_generation, 1);
        assert!(pk2.cmac_ok);
        assert_eq!(pk2.sections().len(), 2);
        assert_eq!(pk2.sections()[0].data, b"kernel image bytes");
        assert!(pk2.sections().iter().all(|s| s.hash_ok));
    }

    #[test]
    fn section_tampering_is_recorded_not_fatal() {
        let mut image = build_package2(&[b"kernel image bytes!!" as &[u8]]);
        let len = image.len();
        image[len - 1] ^= 1;

        let pk2 = Package2::new(&keyset(), &VecStorage::new(image)).unwrap();
        assert!(!pk2.sections()[0].hash_ok);
        assert!(pk2.cmac_ok);
    }

    #[test]
    fn no_key_is_a_decryption_failure() {
        let image = build_package2(&[b"kernel" as &[u8]]);
        let empty = KeySet::from_file_contents("", "").unwrap();
        assert!(matches!(
            Package2::new(&empty, &VecStorage::new(image)),
            Err(Pk21Error::DecryptionFailed)
        ));
    }
}
