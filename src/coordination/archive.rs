use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use super::stamp::RunStamp;
use crate::config::ARCHIVE_DIR_NAME;

/// Receives each successfully loaded file
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive `path`, returning where it ended up
    async fn archive(&self, path: &Path, stamp: &RunStamp) -> Result<PathBuf>;
}

/// Moves files into an `archive` directory next to them, renamed to
/// `<stem>_<YYYYmmdd_HHMMSS><ext>`
#[derive(Debug, Clone)]
pub struct SiblingDirArchiver {
    dir_name: String,
}

impl Default for SiblingDirArchiver {
    fn default() -> Self {
        Self::new(ARCHIVE_DIR_NAME)
    }
}

impl SiblingDirArchiver {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
        }
    }

    pub fn destination(&self, path: &Path, stamp: &RunStamp) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));

        parent
            .join(&self.dir_name)
            .join(format!("{}_{}{}", stem, stamp.file_suffix(), extension))
    }
}

#[async_trait]
impl Archiver for SiblingDirArchiver {
    async fn archive(&self, path: &Path, stamp: &RunStamp) -> Result<PathBuf> {
        let destination = self.destination(path, stamp);
        if let Some(dir) = destination.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create archive directory {}", dir.display()))?;
        }

        fs::rename(path, &destination).await.with_context(|| {
            format!(
                "Failed to move {} to {}",
                path.display(),
                destination.display()
            )
        })?;

        info!("Archived {} to {}", path.display(), destination.display());
        Ok(destination)
    }
}
