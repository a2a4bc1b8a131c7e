//! Chunk store abstraction and its file-backed implementation.
//!
//! The chunk store persists chunk bytes under one copyset's absolute data
//! directory. The per-chunk file layout, internal versioning, and checksum
//! storage are the store's own business; the copyset node only drives the
//! operations below, exclusively from within apply and snapshot-load
//! callbacks. The store must be internally thread-safe since the engine
//! may apply independent entries from more than one worker.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::utils::CopysetError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Chunk ID type.
pub type ChunkId = u64;

/// Snapshot-chunk version (sequence number) type.
pub type ChunkVersion = u64;

/// Chunk-level persistence operations consumed by the copyset node.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Opens the store against the copyset's absolute data directory.
    async fn initialize(&self, dir: &Path) -> Result<(), CopysetError>;

    /// Closes the store. No operation may arrive after this returns.
    async fn uninitialize(&self);

    /// Reads the full contents of a chunk.
    async fn read_chunk(&self, id: ChunkId) -> Result<Bytes, CopysetError>;

    /// Writes (or overwrites) the full contents of a chunk.
    async fn write_chunk(
        &self,
        id: ChunkId,
        data: Bytes,
    ) -> Result<(), CopysetError>;

    /// Deletes a chunk, or one versioned snapshot of it if `version` is
    /// given. Deleting an absent chunk is a no-op.
    async fn delete_chunk(
        &self,
        id: ChunkId,
        version: Option<ChunkVersion>,
    ) -> Result<(), CopysetError>;
}

/// File-backed chunk store: one `{id}.chunk` file per chunk (and
/// `{id}.chunk.{version}` per versioned chunk snapshot) directly under the
/// data directory, so snapshot save/load can ship the directory's file set
/// as-is.
#[derive(Debug, Default)]
pub struct FsChunkStore {
    /// Data directory; `Some` while initialized.
    dir: Mutex<Option<PathBuf>>,
}

impl FsChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chunk_path(
        &self,
        id: ChunkId,
        version: Option<ChunkVersion>,
    ) -> Result<PathBuf, CopysetError> {
        let guard = self.dir.lock().unwrap();
        match guard.as_ref() {
            Some(dir) => Ok(match version {
                Some(ver) => dir.join(format!("{}.chunk.{}", id, ver)),
                None => dir.join(format!("{}.chunk", id)),
            }),
            None => logged_err!("chunk store not initialized"),
        }
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn initialize(&self, dir: &Path) -> Result<(), CopysetError> {
        fs::create_dir_all(dir).await?;
        *self.dir.lock().unwrap() = Some(dir.to_path_buf());
        pf_info!("chunk store opened at '{}'", dir.display());
        Ok(())
    }

    async fn uninitialize(&self) {
        *self.dir.lock().unwrap() = None;
    }

    async fn read_chunk(&self, id: ChunkId) -> Result<Bytes, CopysetError> {
        let path = self.chunk_path(id, None)?;
        Ok(Bytes::from(fs::read(&path).await?))
    }

    async fn write_chunk(
        &self,
        id: ChunkId,
        data: Bytes,
    ) -> Result<(), CopysetError> {
        let path = self.chunk_path(id, None)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn delete_chunk(
        &self,
        id: ChunkId,
        version: Option<ChunkVersion>,
    ) -> Result<(), CopysetError> {
        let path = self.chunk_path(id, version)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // delete-of-absent is naturally idempotent
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    async fn prepare_store(path: &str) -> Result<FsChunkStore, CopysetError> {
        if fs::try_exists(path).await? {
            fs::remove_dir_all(path).await?;
        }
        let store = FsChunkStore::new();
        store.initialize(Path::new(path)).await?;
        Ok(store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn write_read_back() -> Result<(), CopysetError> {
        let store = prepare_store("/tmp/test-chunkstore-0").await?;
        store
            .write_chunk(100001, Bytes::from_static(b"some chunk bytes"))
            .await?;
        assert_eq!(
            store.read_chunk(100001).await?,
            Bytes::from_static(b"some chunk bytes")
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn overwrite_replaces() -> Result<(), CopysetError> {
        let store = prepare_store("/tmp/test-chunkstore-1").await?;
        store
            .write_chunk(7, Bytes::from_static(b"longer original contents"))
            .await?;
        store.write_chunk(7, Bytes::from_static(b"short")).await?;
        assert_eq!(store.read_chunk(7).await?, Bytes::from_static(b"short"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn delete_absent_ok() -> Result<(), CopysetError> {
        let store = prepare_store("/tmp/test-chunkstore-2").await?;
        store.delete_chunk(42, None).await?;
        store.write_chunk(42, Bytes::from_static(b"x")).await?;
        store.delete_chunk(42, None).await?;
        assert!(store.read_chunk(42).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn versioned_delete_targets_snapshot_file() -> Result<(), CopysetError>
    {
        let store = prepare_store("/tmp/test-chunkstore-3").await?;
        store.write_chunk(9, Bytes::from_static(b"live")).await?;
        fs::write("/tmp/test-chunkstore-3/9.chunk.2", b"snap").await?;
        store.delete_chunk(9, Some(2)).await?;
        // live chunk untouched, versioned snapshot file gone
        assert_eq!(store.read_chunk(9).await?, Bytes::from_static(b"live"));
        assert!(!fs::try_exists("/tmp/test-chunkstore-3/9.chunk.2").await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn write_rand_read_rand() -> Result<(), CopysetError> {
        use rand::Rng;
        let store = prepare_store("/tmp/test-chunkstore-4").await?;
        let mut ref_chunks = std::collections::HashMap::new();
        for _ in 0..20 {
            let id: ChunkId = rand::thread_rng().gen_range(0..8);
            let len = rand::thread_rng().gen_range(1..64);
            let data: Vec<u8> = (0..len).map(|_| rand::random()).collect();
            let data = Bytes::from(data);
            store.write_chunk(id, data.clone()).await?;
            ref_chunks.insert(id, data);
        }
        for (id, data) in ref_chunks {
            assert_eq!(store.read_chunk(id).await?, data);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn ops_before_initialize_fail() {
        let store = FsChunkStore::new();
        assert!(store.read_chunk(1).await.is_err());
        assert!(store
            .write_chunk(1, Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
