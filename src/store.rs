//! # Sharded Store
//!
//! On-disk layout for cached files: `<root>/{tmp/, 0/, 1/, ..., N-1/}` with
//! filenames `<hexkey>.<ext>`. Owns directory creation, move-into-place of
//! completed downloads, size accounting and wholesale deletion.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

/// A file found during recursive size accounting
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ShardedStore {
    root_dir: PathBuf,
}

impl ShardedStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    /// Base directory for all cached files.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Directory holding in-progress downloads.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root_dir.join("tmp")
    }

    /// Temporary download path for a key.
    pub fn temp_path(&self, key: &str) -> PathBuf {
        self.tmp_dir().join(key)
    }

    /// Final path for a completed download.
    pub fn final_path(&self, shard: u32, key: &str, extension: &str) -> PathBuf {
        self.root_dir
            .join(shard.to_string())
            .join(format!("{key}.{extension}"))
    }

    /// Create a directory (and missing parents) if it does not exist.
    /// Idempotent; failures are logged rather than returned since the caller
    /// will surface a real error on the subsequent write.
    pub async fn ensure_dir(&self, path: &Path) {
        match fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = fs::create_dir_all(path).await {
                    warn!(path = ?path, error = %e, "Failed to create cache directory");
                }
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to check cache directory");
            }
        }
    }

    /// Create the root and tmp directories up front.
    pub async fn ensure_initialized(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root_dir).await?;
        fs::create_dir_all(self.tmp_dir()).await?;
        Ok(())
    }

    /// Move a completed download into its final location.
    ///
    /// Returns `true` if the destination already existed and `overwrite` is
    /// off: the existing file is trusted and kept, and the temp copy is
    /// discarded. Returns `false` on a normal move.
    pub async fn move_into_place(
        &self,
        temp_path: &Path,
        final_path: &Path,
        overwrite: bool,
    ) -> io::Result<bool> {
        if fs::try_exists(final_path).await? {
            if overwrite {
                fs::remove_file(final_path).await?;
            } else {
                // Same key always maps to the same path, so the existing
                // file is equivalent; reclaim the temp copy.
                if let Err(e) = fs::remove_file(temp_path).await {
                    warn!(path = ?temp_path, error = %e, "Failed to remove superseded temp file");
                }
                return Ok(true);
            }
        }

        if let Some(parent) = final_path.parent() {
            self.ensure_dir(parent).await;
        }

        fs::rename(temp_path, final_path).await?;
        debug!(path = ?final_path, "Moved download into cache");
        Ok(false)
    }

    /// Recursively list all plain files under `path` with their sizes.
    /// A non-existent path yields an empty list; a plain file yields itself.
    pub async fn list_all_files(&self, path: &Path) -> io::Result<Vec<FileEntry>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let meta = fs::metadata(path).await?;
        if meta.is_file() {
            return Ok(vec![FileEntry {
                path: path.to_path_buf(),
                size: meta.len(),
            }]);
        }

        let mut files = Vec::new();
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry_path);
                } else {
                    files.push(FileEntry {
                        path: entry_path,
                        size: meta.len(),
                    });
                }
            }
        }
        Ok(files)
    }

    /// Total size in bytes of all files under `path`.
    pub async fn total_size(&self, path: &Path) -> io::Result<u64> {
        let files = self.list_all_files(path).await?;
        Ok(files.iter().map(|f| f.size).sum())
    }

    /// Delete `path` recursively, then recreate it empty.
    pub async fn wipe(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove cache directory");
                return Err(e);
            }
        }
        fs::create_dir_all(path).await?;
        Ok(())
    }
}
