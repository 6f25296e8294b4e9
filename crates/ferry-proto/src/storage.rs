use std::path::{Path, PathBuf};

use anyhow::Result as AnyResult;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};

/// A directory files are served from or received into.
///
/// Names handed to a `FileRoot` are single path segments; anything that could
/// step outside the directory is rejected before touching the filesystem.
#[derive(Debug, Clone)]
pub struct FileRoot {
    dir: PathBuf,
}

impl FileRoot {
    /// Open `dir` as a file root, creating it if missing.
    pub async fn new(dir: PathBuf) -> AnyResult<Self> {
        fs::create_dir_all(&dir).await?;
        info!("File root: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a validated name.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Open an existing regular file for sending, with its length.
    pub async fn open_for_send(&self, name: &str) -> Result<(fs::File, u64)> {
        let path = self.resolve(name)?;
        let not_found = |_| Error::NotFound(name.to_string());
        let metadata = fs::metadata(&path).await.map_err(not_found)?;
        if !metadata.is_file() {
            return Err(Error::NotFound(name.to_string()));
        }
        let file = fs::File::open(&path).await.map_err(not_found)?;
        Ok((file, metadata.len()))
    }

    /// Create (or truncate) the destination for an incoming file.
    pub async fn create_for_receive(&self, name: &str) -> Result<(fs::File, PathBuf)> {
        let path = self.resolve(name)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok((file, path))
    }
}

/// Reject names that are not exactly one plain path segment.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_whitespace);
    if bad {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
