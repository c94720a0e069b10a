//! Workspace directory bookkeeping

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Filesystem operations on the session directories
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create `path` and any missing parents
    async fn ensure_dir(&self, path: &Path) -> Result<()>;

    /// Remove everything below `path`, leaving an empty directory
    async fn clear(&self, path: &Path) -> Result<()>;
}

/// [`Workspace`] backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsWorkspace;

#[async_trait]
impl Workspace for FsWorkspace {
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn clear(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), "Cleared workspace directory");
        self.ensure_dir(path).await
    }
}
