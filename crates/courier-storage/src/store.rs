//! Namespaced blob store.
//!
//! Key resolution rejects anything that would escape a namespace root:
//! every key must resolve to a direct child of its namespace directory.
//! That check is a security invariant relied on by everything above this
//! layer, not a convenience.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use courier_core::config::StorageConfig;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Blob already exists: {0}")]
    AlreadyExists(String),
    #[error("Missing chunk {0}")]
    MissingChunk(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Blob store rooted at four independent namespace directories.
#[derive(Debug, Clone)]
pub struct BlobStore {
    permanent: PathBuf,
    temp: PathBuf,
    quarantine: PathBuf,
    thumbnail: PathBuf,
}

impl BlobStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            permanent: PathBuf::from(&config.permanent_dir),
            temp: PathBuf::from(&config.temp_dir),
            quarantine: PathBuf::from(&config.quarantine_dir),
            thumbnail: PathBuf::from(&config.thumbnail_dir),
        }
    }

    /// Create all namespace roots. Called once at startup.
    pub async fn init(&self) -> StorageResult<()> {
        for root in [&self.permanent, &self.temp, &self.quarantine, &self.thumbnail] {
            fs::create_dir_all(root).await?;
        }
        Ok(())
    }

    /// Generate a collision-resistant permanent key for an upload.
    pub fn generate_key(original_filename: &str) -> String {
        format!("{}-{}", Uuid::new_v4(), sanitize_filename(original_filename))
    }

    /// Generate a fresh temp namespace key (one per upload session).
    pub fn create_temp_key() -> String {
        Uuid::new_v4().to_string()
    }

    /// Resolve a key under a namespace root, rejecting traversal.
    fn resolve(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let path = root.join(key);
        // A single normal component under the root; anything else escaped.
        let relative = path.strip_prefix(root).map_err(|_| StorageError::InvalidKey(key.to_string()))?;
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(path),
            _ => Err(StorageError::InvalidKey(key.to_string())),
        }
    }

    pub fn permanent_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::resolve(&self.permanent, key)
    }

    pub fn thumbnail_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::resolve(&self.thumbnail, key)
    }

    pub(crate) fn temp_dir(&self, temp_key: &str) -> StorageResult<PathBuf> {
        Self::resolve(&self.temp, temp_key)
    }

    /// Move an assembled file into permanent storage. Write-once: an
    /// existing blob under the same key is an error, never overwritten.
    pub async fn store_permanent(&self, source: &Path, key: &str) -> StorageResult<()> {
        let destination = self.permanent_path(key)?;
        copy_create_new(source, &destination, key).await?;
        debug!(key = key, "Stored permanent blob");
        Ok(())
    }

    /// Store thumbnail bytes under a fresh key; returns the key.
    pub async fn store_thumbnail(&self, data: &[u8], original_filename: &str) -> StorageResult<String> {
        let key = Self::generate_key(original_filename);
        let destination = self.thumbnail_path(&key)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
            .map_err(|e| map_exists(e, &key))?;
        file.write_all(data).await?;
        file.sync_all().await?;
        debug!(key = %key, size = data.len(), "Stored thumbnail");
        Ok(key)
    }

    /// Move an infected blob from permanent to quarantine. A blob already
    /// gone is a no-op; re-quarantine replaces.
    pub async fn move_to_quarantine(&self, key: &str) -> StorageResult<()> {
        let source = self.permanent_path(key)?;
        if fs::try_exists(&source).await? {
            let destination = Self::resolve(&self.quarantine, key)?;
            fs::rename(&source, &destination).await?;
            debug!(key = key, "Moved blob to quarantine");
        }
        Ok(())
    }

    pub async fn quarantine_exists(&self, key: &str) -> StorageResult<bool> {
        let path = Self::resolve(&self.quarantine, key)?;
        Ok(fs::try_exists(&path).await?)
    }

    pub async fn permanent_exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.permanent_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Delete a permanent blob if present. Idempotent.
    pub async fn delete_permanent(&self, key: &str) -> StorageResult<()> {
        delete_if_exists(&self.permanent_path(key)?).await
    }

    /// Delete a thumbnail blob if present. Idempotent.
    pub async fn delete_thumbnail(&self, key: &str) -> StorageResult<()> {
        delete_if_exists(&self.thumbnail_path(key)?).await
    }

    /// Open a permanent blob for reading, with its byte length.
    pub async fn open_permanent(&self, key: &str) -> StorageResult<(fs::File, u64)> {
        let path = self.permanent_path(key)?;
        open_readable(&path, key).await
    }

    /// Open a thumbnail blob for reading, with its byte length.
    pub async fn open_thumbnail(&self, key: &str) -> StorageResult<(fs::File, u64)> {
        let path = self.thumbnail_path(key)?;
        open_readable(&path, key).await
    }
}

async fn open_readable(path: &Path, key: &str) -> StorageResult<(fs::File, u64)> {
    if !fs::try_exists(path).await? {
        return Err(StorageError::NotFound(key.to_string()));
    }
    let file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

async fn delete_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn copy_create_new(source: &Path, destination: &Path, key: &str) -> StorageResult<()> {
    let mut src = fs::File::open(source).await?;
    let mut dst = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await
        .map_err(|e| map_exists(e, key))?;
    tokio::io::copy(&mut src, &mut dst).await?;
    dst.sync_all().await?;
    Ok(())
}

fn map_exists(e: std::io::Error, key: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        StorageError::AlreadyExists(key.to_string())
    } else {
        e.into()
    }
}

/// Collapse whitespace and path separators so the original filename can be
/// embedded in a storage key.
pub fn sanitize_filename(original: &str) -> String {
    let trimmed = original.trim();
    if trimmed.is_empty() {
        return "attachment".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Hex SHA-256 of a file, streamed.
pub async fn sha256_hex(path: &Path) -> StorageResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> BlobStore {
        let root = dir.path().to_str().unwrap();
        BlobStore::new(&StorageConfig {
            permanent_dir: format!("{root}/perm"),
            temp_dir: format!("{root}/tmp"),
            quarantine_dir: format!("{root}/quarantine"),
            thumbnail_dir: format!("{root}/thumbs"),
        })
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        for key in ["../escape", "a/b", "a\\b", "..", ""] {
            assert!(
                matches!(store.permanent_path(key), Err(StorageError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
            assert!(matches!(store.thumbnail_path(key), Err(StorageError::InvalidKey(_))));
        }
    }

    #[tokio::test]
    async fn test_permanent_is_write_once() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        let source = dir.path().join("src.bin");
        fs::write(&source, b"payload").await.unwrap();

        store.store_permanent(&source, "blob-1").await.unwrap();
        let again = store.store_permanent(&source, "blob-1").await;
        assert!(matches!(again, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        store.delete_permanent("never-stored").await.unwrap();

        let source = dir.path().join("src.bin");
        fs::write(&source, b"payload").await.unwrap();
        store.store_permanent(&source, "blob-2").await.unwrap();
        store.delete_permanent("blob-2").await.unwrap();
        store.delete_permanent("blob-2").await.unwrap();
        assert!(!store.permanent_exists("blob-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_quarantine_move() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        let source = dir.path().join("src.bin");
        fs::write(&source, b"eicar").await.unwrap();
        store.store_permanent(&source, "sus").await.unwrap();

        store.move_to_quarantine("sus").await.unwrap();
        assert!(!store.permanent_exists("sus").await.unwrap());
        assert!(store.quarantine_exists("sus").await.unwrap());

        // moving an already-moved blob is a no-op
        store.move_to_quarantine("sus").await.unwrap();
    }

    #[tokio::test]
    async fn test_thumbnail_store_and_open() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        let key = store.store_thumbnail(b"jpeg bytes", "photo.jpg").await.unwrap();
        assert!(key.ends_with("photo.jpg"));

        let (_, len) = store.open_thumbnail(&key).await.unwrap();
        assert_eq!(len, 10);
    }

    #[tokio::test]
    async fn test_open_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.init().await.unwrap();

        let result = store.open_permanent("nope").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my photo.png"), "my_photo.png");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("  "), "attachment");
    }

    #[tokio::test]
    async fn test_sha256_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            sha256_hex(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
