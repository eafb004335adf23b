use async_trait::async_trait;
use std::io;
use std::time::SystemTime;

/// Abstraction for byte-level access to a staged source file
///
/// The dialect detector and the ledger only ever need the file's size, a
/// leading range of bytes and its modification time; keeping them behind this
/// trait lets tests substitute in-memory data.
#[async_trait]
pub trait ByteReader: Send + Sync {
    /// Get the total size of the file in bytes
    async fn size(&self) -> io::Result<u64>;

    /// Read a range of bytes from the file
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>>;

    /// Last modification time of the file
    async fn modified(&self) -> io::Result<SystemTime>;
}

/// Read at most `max_bytes` from the start of the file
///
/// When the file is longer than the sample, the sample is cut back to the last
/// newline so that no partial record (or partial multi-byte character) is
/// handed to the decoder.
pub async fn read_sample(reader: &dyn ByteReader, max_bytes: usize) -> io::Result<Vec<u8>> {
    let file_size = reader.size().await?;
    let end = std::cmp::min(file_size, max_bytes as u64);

    let mut buffer = reader.read_range(0, end).await?;

    if end < file_size
        && let Some(pos) = buffer.iter().rposition(|&b| b == b'\n')
    {
        buffer.truncate(pos + 1);
    }

    Ok(buffer)
}
