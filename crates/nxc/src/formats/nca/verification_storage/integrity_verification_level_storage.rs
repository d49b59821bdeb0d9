use crate::formats::nca::verification_storage::{
    IntegrityCheckLevel, IntegrityStorageType, DIGEST_SIZE,
};
use crate::storage::{
    ReadableBlockStorage, ReadableBlockStorageExt, ReadableStorage, StorageError,
};
use digest::Digest;
use num_integer::Integer;
use sha2::Sha256;
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BlockStatus {
    Unchecked,
    Invalid,
    Valid,
}

/// One level of a hash tree: checks each block of `storage` against the
/// digest stored at `block_index * 0x20` in `hash_storage` (which is itself
/// usually the next level up).
///
/// Block verdicts are memoized, so every block is hashed at most once per
/// session.
#[derive(Debug)]
pub struct IntegrityVerificationLevelStorage<S: ReadableBlockStorage, H: ReadableStorage> {
    storage: S,
    hash_storage: H,
    level: IntegrityCheckLevel,
    ty: IntegrityStorageType,
    block_statuses: Mutex<Vec<BlockStatus>>,
}

impl<S: ReadableBlockStorage, H: ReadableStorage> IntegrityVerificationLevelStorage<S, H> {
    pub fn new(
        storage: S,
        hash_storage: H,
        level: IntegrityCheckLevel,
        ty: IntegrityStorageType,
    ) -> Self {
        let block_count = Integer::div_ceil(&storage.get_size(), &storage.block_size());
        let block_statuses = vec![BlockStatus::Unchecked; block_count.try_into().unwrap()];

        Self {
            storage,
            hash_storage,
            level,
            ty,
            block_statuses: Mutex::new(block_statuses),
        }
    }
}

impl<S: ReadableBlockStorage, H: ReadableStorage> ReadableBlockStorage
    for IntegrityVerificationLevelStorage<S, H>
{
    fn block_size(&self) -> u64 {
        self.storage.block_size()
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let block_size = self.storage.block_size();

        // the trailing block may be smaller than the block size
        let current_block_size = self.nth_block_size(block_index);

        // verification always covers the full block, so partial reads go
        // through a scratch buffer
        let use_scratch = buf.len() as u64 != block_size;
        let mut scratch = vec![0; if use_scratch { block_size as usize } else { 0 }];

        {
            let block_buf: &mut [u8] = if use_scratch { &mut scratch } else { &mut *buf };

            self.storage
                .read_block(block_index, &mut block_buf[..current_block_size as usize])?;

            if self.level != IntegrityCheckLevel::None {
                let mut block_statuses = self.block_statuses.lock().unwrap();
                let block_status = &mut block_statuses[block_index as usize];

                if *block_status == BlockStatus::Unchecked {
                    let bytes_to_hash = match self.ty {
                        IntegrityStorageType::HierarchicalSha256 => {
                            // HierarchicalSha256 does not pad the last block
                            current_block_size
                        }
                        IntegrityStorageType::Ivfc => {
                            // the unused tail of the last block is hashed as zeros
                            block_buf[current_block_size as usize..].fill(0);
                            block_size
                        }
                    };

                    let hash = Sha256::digest(&block_buf[..bytes_to_hash as usize]);
                    let mut expected_hash = [0; DIGEST_SIZE];
                    self.hash_storage
                        .read(block_index * DIGEST_SIZE as u64, &mut expected_hash)?;

                    *block_status = if hash.as_slice() == expected_hash {
                        BlockStatus::Valid
                    } else {
                        tracing::warn!(block_index, "hash mismatch in integrity level");
                        BlockStatus::Invalid
                    };
                }

                if *block_status == BlockStatus::Invalid && self.level == IntegrityCheckLevel::Full
                {
                    return Err(StorageError::IntegrityCheckFailed {});
                }
            }
        }

        if use_scratch {
            let len = buf.len();
            buf.copy_from_slice(&scratch[..len]);
        }
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}
