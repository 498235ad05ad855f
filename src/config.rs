use std::path::PathBuf;
use std::time::Duration;

/// Subdirectory appended to the configured root for all cached files.
pub const CACHE_SUBDIR: &str = "cache-images";

/// Default number of shard directories.
pub const DEFAULT_SHARD_COUNT: u32 = 17;

/// Configuration for the cache engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Base directory for cache storage. If `None`, the system temp
    /// directory is used.
    pub root_dir: Option<PathBuf>,

    /// Number of shard directories spread under the cache root.
    pub shard_count: u32,

    /// Whether a completed download replaces an already-cached file for the
    /// same key. When `false` the existing file is trusted and kept.
    pub overwrite: bool,

    /// Overall timeout for a single HTTP request.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection).
    pub connect_timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string for outgoing requests.
    pub user_agent: String,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: None, // If None, we'll use system temp dir
            shard_count: DEFAULT_SHARD_COUNT,
            overwrite: false,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl CacheConfig {
    /// Set the base directory for cache storage.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    /// Set the number of shard directories.
    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    /// Set the overwrite policy for completed downloads.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Resolved cache root: configured base (or system temp) plus the fixed
    /// cache subdirectory.
    pub fn cache_root(&self) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(CACHE_SUBDIR)
    }
}
