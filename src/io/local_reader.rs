use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

use super::byte_reader::ByteReader;

/// ByteReader implementation for local files
#[derive(Clone)]
pub struct LocalFileByteReader {
    file_path: PathBuf,
}

impl LocalFileByteReader {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ByteReader for LocalFileByteReader {
    async fn size(&self) -> io::Result<u64> {
        let metadata = tokio::fs::metadata(&self.file_path).await?;
        Ok(metadata.len())
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let file = File::open(&self.file_path).await?;

        let mut file = BufReader::new(file);
        file.seek(io::SeekFrom::Start(start)).await?;

        let size = end.saturating_sub(start) as usize;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn modified(&self) -> io::Result<SystemTime> {
        tokio::fs::metadata(&self.file_path).await?.modified()
    }
}
