use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::buffer_pool::PooledBuffer;
use crate::types::Chunk;
use crate::TransferError;

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Number of chunks needed to cover `total_bytes`.
///
/// Returns 0 for an empty object or a zero chunk size.
pub fn chunk_count(total_bytes: u64, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_bytes.div_ceil(chunk_size as u64) as usize
}

/// Splits `[0, total_bytes)` into ordered, contiguous chunks of `chunk_size`
/// bytes. The last chunk may be shorter.
pub fn plan(total_bytes: u64, chunk_size: usize) -> Vec<Chunk> {
    let count = chunk_count(total_bytes, chunk_size);
    let size = chunk_size as u64;
    (0..count)
        .map(|index| {
            let start_byte = index as u64 * size;
            Chunk {
                index,
                start_byte,
                end_byte: (start_byte + size).min(total_bytes) - 1,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads a stream of unknown length into chunk-sized buffers.
pub struct ChunkReader<R> {
    reader: BufReader<R>,
    chunk_size: usize,
    offset: u64,
    next_index: usize,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            chunk_size,
            offset: 0,
            next_index: 0,
        }
    }

    /// Fills `buffer` with the next chunk. Returns `None` at end of stream.
    ///
    /// Short reads are retried until the chunk is full or the stream ends,
    /// so only the final chunk can be shorter than `chunk_size`.
    pub async fn next_chunk(
        &mut self,
        buffer: &mut PooledBuffer,
    ) -> Result<Option<Chunk>, TransferError> {
        let data = buffer.as_mut_vec();
        data.clear();
        data.reserve_exact(self.chunk_size);
        while data.len() < self.chunk_size {
            let remaining = (self.chunk_size - data.len()) as u64;
            let read = (&mut self.reader)
                .take(remaining)
                .read_buf(data)
                .await
                .map_err(TransferError::source_read)?;
            if read == 0 {
                break;
            }
        }
        let n = data.len();
        if n == 0 {
            return Ok(None);
        }

        let chunk = Chunk {
            index: self.next_index,
            start_byte: self.offset,
            end_byte: self.offset + n as u64 - 1,
        };
        self.offset += n as u64;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Returns `true` if the stream has no more bytes.
    pub async fn at_eof(&mut self) -> Result<bool, TransferError> {
        let buf = self
            .reader
            .fill_buf()
            .await
            .map_err(TransferError::source_read)?;
        Ok(buf.is_empty())
    }

    /// Bytes consumed from the stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }
}
