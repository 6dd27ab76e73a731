use std::cmp::min;
use std::io::{self, Seek, SeekFrom, Write};

use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::pool::ChunkPool;

/// Scratch output made of blocks borrowed from a [`ChunkPool`].
///
/// The buffer keeps a write cursor and a logical length that are independent of block
/// boundaries. The cursor can be moved back (never past the end) to overwrite bytes that were
/// reserved earlier, such as a length placeholder.
///
/// [`drain`](StagingBuffer::drain) consumes the buffer, so it runs at most once. Every borrowed
/// block goes back to the pool when the buffer is dropped, whether it was drained or not.
pub struct StagingBuffer {
    pool: ChunkPool,
    blocks: Vec<BytesMut>,
    position: usize,
    len: usize,
}

impl StagingBuffer {
    pub fn new(pool: &ChunkPool) -> StagingBuffer {
        StagingBuffer {
            pool: pool.clone(),
            blocks: Vec::new(),
            position: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor to `position`, which must not be past the current length.
    pub fn set_position(&mut self, position: usize) -> io::Result<()> {
        if position > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot seek to {} in a staging buffer of {} bytes",
                    position, self.len
                ),
            ));
        }
        self.position = position;
        Ok(())
    }

    /// Writes the buffered bytes, in order, to `sink`.
    pub fn drain<W: Write + ?Sized>(self, sink: &mut W) -> io::Result<()> {
        trace!(
            "draining {} staged bytes from {} blocks",
            self.len,
            self.blocks.len()
        );
        for chunk in self.chunks() {
            sink.write_all(chunk)?;
        }
        Ok(())
    }

    /// Asynchronous [`drain`](StagingBuffer::drain). Dropping the returned future before it
    /// completes still returns every block to the pool.
    pub async fn drain_async<W: AsyncWrite + Unpin + ?Sized>(self, sink: &mut W) -> io::Result<()> {
        trace!("draining {} staged bytes asynchronously", self.len);
        for chunk in self.chunks() {
            sink.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Copies the content into a contiguous vector and releases the blocks.
    pub fn into_vec(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }

    // The written prefix of each block, up to the logical length.
    fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let block_size = self.pool.block_size();
        let len = self.len;
        self.blocks.iter().enumerate().filter_map(move |(index, block)| {
            let start = index * block_size;
            if start >= len {
                None
            } else {
                Some(&block[..min(block_size, len - start)])
            }
        })
    }
}

impl Write for StagingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let block_size = self.pool.block_size();
        let mut remaining = buf;
        while !remaining.is_empty() {
            let index = self.position / block_size;
            let offset = self.position % block_size;
            while self.blocks.len() <= index {
                let block = self.pool.borrow();
                self.blocks.push(block);
            }
            let count = min(block_size - offset, remaining.len());
            self.blocks[index][offset..offset + count].copy_from_slice(&remaining[..count]);
            self.position += count;
            remaining = &remaining[count..];
        }
        if self.position > self.len {
            self.len = self.position;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for StagingBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset as i128),
            SeekFrom::End(offset) => Some(self.len as i128 + offset as i128),
            SeekFrom::Current(offset) => Some(self.position as i128 + offset as i128),
        };
        match target {
            Some(target) if target >= 0 => {
                self.set_position(target as usize)?;
                Ok(self.position as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before the start of a staging buffer",
            )),
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.pool.give_back(block);
        }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("blocks", &self.blocks.len())
            .field("position", &self.position)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn writes_span_block_boundaries() {
        let pool = ChunkPool::new(4);
        let mut staging = StagingBuffer::new(&pool);
        staging.write_all(b"hello, ").unwrap();
        staging.write_all(b"world").unwrap();
        assert_eq!(staging.len(), 12);
        assert_eq!(pool.stats().leased, 3);

        let mut sink = vec![];
        staging.drain(&mut sink).unwrap();
        assert_eq!(sink, b"hello, world".to_vec());
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().available, 3);
    }

    #[test]
    fn seek_back_patches_a_placeholder() {
        let pool = ChunkPool::new(3);
        let mut staging = StagingBuffer::new(&pool);
        staging.write_all(&[0, 0, 0, 0]).unwrap();
        staging.write_all(b"body").unwrap();
        staging.seek(SeekFrom::Start(1)).unwrap();
        staging.write_all(&[0xAB, 0xCD]).unwrap();
        assert_eq!(staging.position(), 3);
        assert_eq!(staging.len(), 8);
        staging.seek(SeekFrom::End(0)).unwrap();
        staging.write_all(b"!").unwrap();
        assert_eq!(staging.into_vec(), vec![0, 0xAB, 0xCD, 0, b'b', b'o', b'd', b'y', b'!']);
    }

    #[test]
    fn seek_past_the_end_is_rejected() {
        let pool = ChunkPool::new(8);
        let mut staging = StagingBuffer::new(&pool);
        staging.write_all(b"abc").unwrap();
        assert!(staging.seek(SeekFrom::Start(4)).is_err());
        assert!(staging.seek(SeekFrom::Current(-4)).is_err());
        assert_eq!(staging.seek(SeekFrom::Current(-1)).unwrap(), 2);
    }

    #[test]
    fn dropping_without_drain_returns_blocks() {
        let pool = ChunkPool::new(2);
        {
            let mut staging = StagingBuffer::new(&pool);
            staging.write_all(b"abcdef").unwrap();
            assert_eq!(pool.stats().leased, 3);
        }
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().available, 3);
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_drain_still_returns_blocks() {
        let pool = ChunkPool::new(2);
        let mut staging = StagingBuffer::new(&pool);
        staging.write_all(b"abcd").unwrap();
        let error = staging.drain(&mut BrokenSink).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn drains_into_async_writers() {
        let pool = ChunkPool::new(5);
        let mut staging = StagingBuffer::new(&pool);
        staging.write_all(b"asynchronous").unwrap();
        let mut sink: Vec<u8> = vec![];
        staging.drain_async(&mut sink).await.unwrap();
        assert_eq!(sink, b"asynchronous".to_vec());
        assert_eq!(pool.stats().leased, 0);
    }
}
