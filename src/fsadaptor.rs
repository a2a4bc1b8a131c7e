//! File-system capability interface for snapshot I/O.
//!
//! Snapshot save enumerates live chunk files; snapshot load moves files
//! from an opened snapshot into the live data directory. Both go through
//! this minimal seam so tests and alternative storage backends can swap
//! the filesystem out.

use std::path::Path;

use crate::utils::CopysetError;

use async_trait::async_trait;

/// Minimal file-system capabilities the copyset node needs.
#[async_trait]
pub trait FsAdaptor: Send + Sync + 'static {
    /// Names of the files directly under `path` (no recursion, no
    /// subdirectories).
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, CopysetError>;

    /// Atomically moves `src` to `dst`, overwriting any existing file.
    async fn rename(&self, src: &Path, dst: &Path) -> Result<(), CopysetError>;
}

/// `FsAdaptor` over the local filesystem, backing the `local://` protocol.
#[derive(Debug, Default)]
pub struct LocalFsAdaptor;

#[async_trait]
impl FsAdaptor for LocalFsAdaptor {
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, CopysetError> {
        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    async fn rename(&self, src: &Path, dst: &Path) -> Result<(), CopysetError> {
        tokio::fs::rename(src, dst).await?;
        Ok(())
    }
}
