use crate::storage::{ReadableBlockStorage, ReadableStorage, StorageError};

/// Exposes a byte-addressed storage as fixed-size blocks.
#[derive(Debug)]
pub struct BlockAdapterStorage<S: ReadableStorage> {
    storage: S,
    block_size: u64,
}

impl<S: ReadableStorage> BlockAdapterStorage<S> {
    pub fn new(storage: S, block_size: u64) -> Self {
        Self {
            storage,
            block_size,
        }
    }
}

impl<S: ReadableStorage> ReadableBlockStorage for BlockAdapterStorage<S> {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_block(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        assert!(
            buf.len() as u64 <= self.block_size,
            "Read must not span blocks"
        );
        let offset = block_index * self.block_size;
        self.storage.read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }

    fn read_block_bulk(&self, block_index: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset = block_index * self.block_size;
        self.storage.read(offset, buf)
    }
}
