use crate::storage::{ReadableBlockStorage, ReadableStorage, StorageError};

/// Turns a block storage back into a byte-addressed one, buffering the
/// partial head and tail blocks of unaligned reads.
#[derive(Debug)]
pub struct LinearAdapterStorage<S: ReadableBlockStorage> {
    storage: S,
}

impl<S: ReadableBlockStorage> LinearAdapterStorage<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

impl<S: ReadableBlockStorage> ReadableStorage for LinearAdapterStorage<S> {
    fn read(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.get_size() {
            return Err(StorageError::OutOfBounds {});
        }

        let block_size = self.storage.block_size();
        let mut block_buffer = vec![0u8; block_size as usize];

        // read head (block-unaligned start)
        let head_block_offset = offset % block_size;
        if head_block_offset != 0 {
            let head_block_index = offset / block_size;
            let head_read_size = std::cmp::min(
                self.storage.get_size() - head_block_index * block_size,
                block_size,
            );
            self.storage
                .read_block(head_block_index, &mut block_buffer[..head_read_size as usize])?;
            let head_size = std::cmp::min(block_size - head_block_offset, buf.len() as u64);
            buf[..head_size as usize].copy_from_slice(
                &block_buffer[head_block_offset as usize..][..head_size as usize],
            );

            offset += head_size;
            buf = &mut buf[head_size as usize..];
        }

        // read body (block-aligned center)
        let body_block_count = buf.len() / block_size as usize;
        if body_block_count > 0 {
            self.storage.read_block_bulk(
                offset / block_size,
                &mut buf[..body_block_count * block_size as usize],
            )?;

            offset += body_block_count as u64 * block_size;
            buf = &mut buf[body_block_count * block_size as usize..];
        }

        // read tail (block-unaligned end)
        if !buf.is_empty() {
            let tail_block_index = offset / block_size;
            let tail_read_size =
                std::cmp::min(self.storage.get_size() - tail_block_index * block_size, block_size);
            self.storage
                .read_block(tail_block_index, &mut block_buffer[..tail_read_size as usize])?;
            buf.copy_from_slice(&block_buffer[..buf.len()]);
        }

        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.storage.get_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockAdapterStorage, VecStorage};

    fn storage() -> LinearAdapterStorage<BlockAdapterStorage<VecStorage>> {
        // 10 bytes, 4-byte blocks: last block is partial
        let inner = VecStorage::new(b"0123456789".to_vec());
        LinearAdapterStorage::new(BlockAdapterStorage::new(inner, 4))
    }

    fn check_read(offset: u64, expected: &[u8]) {
        let storage = storage();
        let mut buf = vec![0; expected.len()];
        storage.read(offset, &mut buf).unwrap();
        assert_eq!(&buf, expected);
    }

    #[test]
    fn aligned_reads() {
        check_read(0, b"0123");
        check_read(4, b"45678");
        check_read(8, b"89");
    }

    #[test]
    fn unaligned_reads() {
        check_read(1, b"12");
        check_read(1, b"123456");
        check_read(3, b"345");
        check_read(5, b"56789");
        check_read(9, b"9");
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let storage = storage();
        let mut buf = [0; 4];
        assert!(storage.read(8, &mut buf).is_err());
    }
}
