use crate::crypto::{AesKey, AesXtsKey};
use crate::storage::BlockTransform;
use crate::hexstring::HexData;

/// AES-CTR keystream transform, 0x10-byte blocks.
///
/// The counter is the 16-byte big-endian base nonce plus the block index:
/// the upper 8 bytes carry the section nonce, the lower 8 bytes the offset of
/// the block within the file. Getting this sum wrong corrupts every block but
/// the first, so [`get_ctr`](Self::get_ctr) is pinned by a unit test.
#[derive(Debug, Clone)]
pub struct AesCtrBlockTransform {
    key: AesKey,
    nonce: HexData<0x10>,
}

impl AesCtrBlockTransform {
    pub const BLOCK_SIZE: u64 = 0x10;

    /// `section_nonce` is the upper-counter value from the FS header,
    /// `start_offset` the absolute file offset the section begins at.
    pub fn new(key: AesKey, section_nonce: u64, start_offset: u64) -> Self {
        let mut nonce = [0; 0x10];
        nonce[..8].copy_from_slice(&section_nonce.to_be_bytes());
        nonce[8..].copy_from_slice(&(start_offset / Self::BLOCK_SIZE).to_be_bytes());
        Self {
            key,
            nonce: HexData(nonce),
        }
    }

    fn get_ctr(&self, block_index: u64) -> [u8; 0x10] {
        (u128::from_be_bytes(self.nonce.0) + block_index as u128).to_be_bytes()
    }
}

impl BlockTransform for AesCtrBlockTransform {
    fn block_size(&self) -> u64 {
        Self::BLOCK_SIZE
    }

    fn transform_read(&self, block: &mut [u8], block_index: u64) {
        debug_assert_eq!(block.len() as u64 % Self::BLOCK_SIZE, 0);

        self.key.decrypt_ctr(block, &self.get_ctr(block_index));
    }
}

/// AES-XTS sector transform. Sector number = initial sector + block index;
/// each sector decrypts independently of every other.
#[derive(Debug, Clone)]
pub struct AesXtsBlockTransform {
    key: AesXtsKey,
    sector_size: u64,
    initial_sector: u64,
}

impl AesXtsBlockTransform {
    pub fn new(key: AesXtsKey, sector_size: u64, initial_sector: u64) -> Self {
        Self {
            key,
            sector_size,
            initial_sector,
        }
    }
}

impl BlockTransform for AesXtsBlockTransform {
    fn block_size(&self) -> u64 {
        self.sector_size
    }

    fn transform_read(&self, block: &mut [u8], block_index: u64) {
        debug_assert_eq!(block.len() as u64 % self.sector_size, 0);

        self.key.decrypt(
            block,
            (self.initial_sector + block_index) as usize,
            self.sector_size as usize,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_counter_layout() {
        let key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let transform = AesCtrBlockTransform::new(key, 0xdeadbeef, 0x4000);

        // upper 8 bytes: section nonce; lower 8 bytes: file offset / 0x10
        let ctr = transform.get_ctr(0);
        assert_eq!(&ctr[..8], &0xdeadbeefu64.to_be_bytes());
        assert_eq!(&ctr[8..], &0x400u64.to_be_bytes());

        // the block index is added to the whole counter value
        let ctr = transform.get_ctr(3);
        assert_eq!(&ctr[8..], &0x403u64.to_be_bytes());
    }

    #[test]
    fn ctr_counter_carries_into_nonce() {
        let key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let transform = AesCtrBlockTransform::new(key, 1, 0x100);

        // 2^64 + 0x10 + (2^64 - 1) = 2 * 2^64 + 0xf
        let ctr = transform.get_ctr(u64::MAX);
        assert_eq!(&ctr[..8], &2u64.to_be_bytes());
        assert_eq!(&ctr[8..], &0xfu64.to_be_bytes());
    }
}
