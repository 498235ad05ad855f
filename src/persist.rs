//! # Persisted Store
//!
//! The key-value seam the cache index persists through. The engine only
//! needs `get` and `set` of opaque bytes; hosts can plug in whatever durable
//! store they have. [`FileKvStore`] is the default implementation, keeping
//! each record in a file under a base directory.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io;

/// A durable key-value store consumed by the cache index
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the record stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous record.
    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()>;
}

/// File-backed [`KvStore`]: one file per key under a base directory
#[derive(Debug, Clone)]
pub struct FileKvStore {
    base_dir: PathBuf,
}

impl FileKvStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.base_dir).await?;

        // Write to a temporary file then rename so a crash mid-write never
        // leaves a truncated record.
        let path = self.record_path(key);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, value).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}
