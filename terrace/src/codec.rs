//! Row-group stream serialization.
//!
//! Stream layout:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (16 bytes)                            │
//! │   - Magic: "TRRG" (4 bytes)                  │
//! │   - Format version: u32                      │
//! │   - Rows per group: u32                      │
//! │   - Reserved: u32                            │
//! ├──────────────────────────────────────────────┤
//! │ Row groups (repeated until end of stream)    │
//! │   - Row count: u32                           │
//! │   - Payload length: u32                      │
//! │   - Payload (bincode Vec<T>)                 │
//! │   - CRC32 of payload: u32                    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A zero-length stream is a valid empty dataset; the header is only
//! written once the first group flushes, so an empty writer leaves the
//! stream at length zero.

use std::io::SeekFrom;

use async_stream::try_stream;
use futures::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::model::Row;
use crate::store::BoxedStream;
use crate::{ensure_active, Result, TerraceError};

pub const MAGIC: &[u8; 4] = b"TRRG";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const GROUP_HEADER_SIZE: usize = 8;

/// Fill `buf` from the stream; a short count means the stream ended.
async fn read_up_to(stream: &mut BoxedStream, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Validate the stream header. `Ok(false)` means the stream is empty.
async fn read_header(stream: &mut BoxedStream) -> Result<bool> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_up_to(stream, &mut header).await?;
    if n == 0 {
        return Ok(false);
    }
    if n < HEADER_SIZE || &header[0..4] != MAGIC {
        return Err(TerraceError::InvalidStreamFormat);
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(TerraceError::VersionMismatch {
            expected: FORMAT_VERSION,
            actual: version,
        });
    }
    Ok(true)
}

/// Read and verify one row group. `Ok(None)` means end of stream.
async fn read_group<T: Row>(stream: &mut BoxedStream) -> Result<Option<Vec<T>>> {
    let mut group = [0u8; GROUP_HEADER_SIZE];
    let n = read_up_to(stream, &mut group).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < GROUP_HEADER_SIZE {
        return Err(TerraceError::InvalidStreamFormat);
    }
    let row_count = u32::from_le_bytes(group[0..4].try_into().unwrap()) as usize;
    let payload_len = u32::from_le_bytes(group[4..8].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    let mut crc = [0u8; 4];
    stream.read_exact(&mut crc).await?;
    if crc32fast::hash(&payload) != u32::from_le_bytes(crc) {
        return Err(TerraceError::ChecksumMismatch);
    }

    let rows: Vec<T> = bincode::deserialize(&payload)
        .map_err(|e| TerraceError::Serialization(e.to_string()))?;
    if rows.len() != row_count {
        return Err(TerraceError::InvalidStreamFormat);
    }
    Ok(Some(rows))
}

/// Lazily read every row of a stream positioned at 0.
pub fn read_rows<T: Row>(mut stream: BoxedStream) -> BoxStream<'static, Result<T>> {
    Box::pin(try_stream! {
        if read_header(&mut stream).await? {
            while let Some(rows) = read_group::<T>(&mut stream).await? {
                for row in rows {
                    yield row;
                }
            }
        }
    })
}

/// Buffered row-group writer.
pub struct RowWriter<T: Row> {
    stream: BoxedStream,
    rows_per_group: usize,
    buf: Vec<T>,
    header_written: bool,
    rows_written: u64,
}

impl<T: Row> RowWriter<T> {
    pub fn new(stream: BoxedStream, rows_per_group: usize) -> Self {
        Self {
            stream,
            rows_per_group: rows_per_group.max(1),
            buf: Vec::new(),
            header_written: false,
            rows_written: 0,
        }
    }

    pub async fn push(&mut self, row: T, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        self.buf.push(row);
        if self.buf.len() >= self.rows_per_group {
            self.flush_group().await?;
        }
        Ok(())
    }

    pub async fn add_batch(
        &mut self,
        rows: impl IntoIterator<Item = T>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for row in rows {
            self.push(row, cancel).await?;
        }
        Ok(())
    }

    async fn flush_group(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(MAGIC);
            header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            header[8..12].copy_from_slice(&(self.rows_per_group as u32).to_le_bytes());
            self.stream.write_all(&header).await?;
            self.header_written = true;
        }
        let payload = bincode::serialize(&self.buf)
            .map_err(|e| TerraceError::Serialization(e.to_string()))?;
        self.stream
            .write_all(&(self.buf.len() as u32).to_le_bytes())
            .await?;
        self.stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(&payload).await?;
        self.stream
            .write_all(&crc32fast::hash(&payload).to_le_bytes())
            .await?;
        self.rows_written += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush the trailing group and reposition the stream to 0.
    ///
    /// Returns the total number of rows written.
    pub async fn finish(mut self, cancel: &CancellationToken) -> Result<u64> {
        ensure_active(cancel)?;
        self.flush_group().await?;
        self.stream.flush().await?;
        self.stream.seek(SeekFrom::Start(0)).await?;
        Ok(self.rows_written)
    }
}
