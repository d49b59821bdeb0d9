use crate::crypto::{AesKey, AesXtsKey};
use crate::storage::block_transforms::{AesCtrBlockTransform, AesXtsBlockTransform};
use crate::storage::{
    AesCtrStorage, AesXtsStorage, BlockAdapterStorage, LinearAdapterStorage, ReadableStorage,
    StorageError,
};

/// The cipher layer of one NCA section, tagged by the FS header's
/// encryption type.
#[derive(Debug)]
pub enum NcaCryptStorage<S: ReadableStorage> {
    Plaintext(S),
    AesCtr(LinearAdapterStorage<AesCtrStorage<BlockAdapterStorage<S>>>),
    AesXts(LinearAdapterStorage<AesXtsStorage<BlockAdapterStorage<S>>>),
}

impl<S: ReadableStorage> NcaCryptStorage<S> {
    pub fn new_plaintext(storage: S) -> Self {
        Self::Plaintext(storage)
    }

    /// The CTR nonce is `upper_counter || start_offset / 0x10`; the block
    /// transform adds the in-section block index on top.
    pub fn new_ctr(storage: S, key: AesKey, upper_counter: u64, start_offset: u64) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, AesCtrBlockTransform::BLOCK_SIZE);
        let transform = AesCtrBlockTransform::new(key, upper_counter, start_offset);
        let aes_ctr = AesCtrStorage::new(block_adapter, transform);

        Self::AesCtr(LinearAdapterStorage::new(aes_ctr))
    }

    /// Sector numbering continues the position of the section within the
    /// file: the first sector is `start_offset / sector_size`.
    pub fn new_xts(storage: S, key: AesXtsKey, sector_size: u64, start_offset: u64) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, sector_size);
        let transform = AesXtsBlockTransform::new(key, sector_size, start_offset / sector_size);
        let aes_xts = AesXtsStorage::new(block_adapter, transform);

        Self::AesXts(LinearAdapterStorage::new(aes_xts))
    }
}

impl<S: ReadableStorage> ReadableStorage for NcaCryptStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesXts(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.get_size(),
            NcaCryptStorage::AesCtr(storage) => storage.get_size(),
            NcaCryptStorage::AesXts(storage) => storage.get_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ReadableStorageExt, VecStorage};

    #[test]
    fn ctr_view_decrypts_what_the_key_encrypted() {
        let key: AesKey = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let upper_counter: u64 = 0x1122334455667788;
        let start_offset = 0x8000;

        let plaintext = b"the quick brown fox jumps over the lazy dog padd".to_vec();
        assert_eq!(plaintext.len() % 0x10, 0);

        // encrypt manually with the same counter layout
        let mut encrypted = plaintext.clone();
        let mut ctr = [0u8; 0x10];
        ctr[..8].copy_from_slice(&upper_counter.to_be_bytes());
        ctr[8..].copy_from_slice(&(start_offset / 0x10u64).to_be_bytes());
        key.encrypt_ctr(&mut encrypted, &ctr);

        let storage =
            NcaCryptStorage::new_ctr(VecStorage::new(encrypted), key, upper_counter, start_offset);
        assert_eq!(storage.read_all().unwrap(), plaintext);

        // unaligned read
        let mut buf = [0; 11];
        storage.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"quick brown");
    }

    #[test]
    fn xts_view_starts_at_the_section_sector() {
        let key: AesXtsKey = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            .parse()
            .unwrap();

        let plaintext = vec![0x5a; 0x400];
        let mut encrypted = plaintext.clone();
        // encrypt = inverse of decrypt for sectors 4 and 5
        {
            use cipher::KeyInit;
            let k1 = aes::Aes128::new_from_slice(&hex::decode("000102030405060708090a0b0c0d0e0f").unwrap()).unwrap();
            let k2 = aes::Aes128::new_from_slice(&hex::decode("101112131415161718191a1b1c1d1e1f").unwrap()).unwrap();
            let xts = xts_mode::Xts128::new(k1, k2);
            for (i, sector) in encrypted.chunks_mut(0x200).enumerate() {
                let mut tweak = [0u8; 0x10];
                tweak[8..].copy_from_slice(&(4u64 + i as u64).to_be_bytes());
                xts.encrypt_sector(sector, tweak);
            }
        }

        let storage = NcaCryptStorage::new_xts(VecStorage::new(encrypted), key, 0x200, 0x800);
        assert_eq!(storage.read_all().unwrap(), plaintext);
    }
}
