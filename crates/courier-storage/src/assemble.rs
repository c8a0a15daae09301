//! Chunk assembly.
//!
//! Each upload session owns one directory under the temp namespace. Chunks
//! arrive as `chunk-<index>` files in any order; assembly concatenates them
//! in index order into `upload.bin`. Single-chunk uploads skip the chunk
//! files and write `upload.bin` directly.

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::store::{BlobStore, StorageError, StorageResult};

const ASSEMBLED_NAME: &str = "upload.bin";

impl BlobStore {
    /// Path of the assembled byte stream for a session.
    pub fn assembled_path(&self, temp_key: &str) -> StorageResult<PathBuf> {
        Ok(self.temp_dir(temp_key)?.join(ASSEMBLED_NAME))
    }

    pub async fn ensure_temp_dir(&self, temp_key: &str) -> StorageResult<()> {
        fs::create_dir_all(self.temp_dir(temp_key)?).await?;
        Ok(())
    }

    /// Write a whole single-chunk upload. Re-delivery truncates.
    pub async fn write_temp_file(&self, temp_key: &str, data: &[u8]) -> StorageResult<()> {
        self.ensure_temp_dir(temp_key).await?;
        let path = self.assembled_path(temp_key)?;
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write one chunk of a multi-chunk upload. Re-delivery truncates.
    pub async fn write_chunk(&self, temp_key: &str, index: u32, data: &[u8]) -> StorageResult<()> {
        self.ensure_temp_dir(temp_key).await?;
        let path = self.temp_dir(temp_key)?.join(format!("chunk-{index}"));
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        debug!(temp_key = temp_key, index = index, size = data.len(), "Chunk written");
        Ok(())
    }

    /// Concatenate all declared chunks in index order into `upload.bin`.
    /// Any missing chunk aborts assembly.
    pub async fn assemble_chunks(&self, temp_key: &str, total_chunks: u32) -> StorageResult<PathBuf> {
        let target = self.assembled_path(temp_key)?;
        if fs::try_exists(&target).await? {
            fs::remove_file(&target).await?;
        }
        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await?;
        for index in 0..total_chunks {
            let chunk = self.temp_dir(temp_key)?.join(format!("chunk-{index}"));
            if !fs::try_exists(&chunk).await? {
                return Err(StorageError::MissingChunk(index));
            }
            let mut src = fs::File::open(&chunk).await?;
            tokio::io::copy(&mut src, &mut out).await?;
        }
        out.sync_all().await?;
        debug!(temp_key = temp_key, total_chunks = total_chunks, "Chunks assembled");
        Ok(target)
    }

    /// Remove a session's temp directory and everything in it. Idempotent;
    /// cleanup failures surface to the caller who decides whether to care.
    pub async fn delete_temp(&self, temp_key: &str) -> StorageResult<()> {
        let dir = self.temp_dir(temp_key)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
