//! # Cache Manager
//!
//! Top-level facade composing the key deriver, sharded store, persisted
//! index and fetch coordinator. Constructed once at startup and passed to
//! consumers; construction performs the directory and index initialization
//! up front so the first resolve does not depend on lazy safety nets.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::coordinator::FetchCoordinator;
use crate::error::CacheError;
use crate::index::CacheIndex;
use crate::persist::{FileKvStore, KvStore};
use crate::store::ShardedStore;
use crate::transport::{HttpTransport, Transport};

pub struct CacheManager {
    store: ShardedStore,
    index: Arc<CacheIndex>,
    coordinator: Arc<FetchCoordinator>,
}

impl CacheManager {
    /// Create a cache manager with the default HTTP transport and a
    /// file-backed index store next to the cache directory.
    pub async fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let kv_dir = config
            .root_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let kv_store = Arc::new(FileKvStore::new(kv_dir));
        Self::with_parts(config, transport, kv_store).await
    }

    /// Create a cache manager with explicit transport and index store
    /// implementations.
    pub async fn with_parts(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        kv_store: Arc<dyn KvStore>,
    ) -> Result<Self, CacheError> {
        let store = ShardedStore::new(config.cache_root());
        store.ensure_initialized().await?;

        let index = Arc::new(CacheIndex::new(kv_store));
        // Hydrate eagerly so resolve calls start from a warm index.
        index.ensure_fresh().await;

        let coordinator = Arc::new(FetchCoordinator::new(
            transport,
            store.clone(),
            index.clone(),
            config.shard_count,
            config.overwrite,
        ));

        Ok(Self {
            store,
            index,
            coordinator,
        })
    }

    /// Resolve an identifier to a local path, fetching and caching it on
    /// first access. Non-remote identifiers are returned unchanged. A stale
    /// index entry whose file vanished out-of-band triggers a refetch.
    pub async fn resolve(&self, uri: &str) -> Result<PathBuf, CacheError> {
        if !is_remote(uri) {
            return Ok(PathBuf::from(uri));
        }

        if let Some(path) = self.index.lookup(uri).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(uri = %uri, path = ?path, "Cache hit");
                return Ok(path);
            }
            debug!(uri = %uri, path = ?path, "Indexed file missing, refetching");
        }

        self.coordinator.request(uri).await
    }

    /// Like [`resolve`](Self::resolve), but falls back to the original
    /// identifier when no cached path can be produced, so downstream
    /// rendering can still attempt a direct fetch.
    pub async fn resolve_or_remote(&self, uri: &str) -> String {
        match self.resolve(uri).await {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(uri = %uri, error = %e, "Falling back to remote identifier");
                uri.to_owned()
            }
        }
    }

    /// Total size of the cache directory in bytes.
    pub async fn size(&self) -> Result<u64, CacheError> {
        Ok(self.store.total_size(self.store.root_dir()).await?)
    }

    /// Human-readable cache size: `"<KB>KB"` below 1 MiB, `"<MB>MB"` with
    /// two decimals otherwise.
    pub async fn size_formatted(&self) -> Result<String, CacheError> {
        Ok(format_size(self.size().await?))
    }

    /// Delete every cached file and reset the persisted index. In-flight
    /// download tracking is dropped without cancelling the underlying
    /// transport calls.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.wipe(self.store.root_dir()).await?;
        self.store.ensure_initialized().await?;
        self.index.reset_and_persist().await;
        self.coordinator.drop_in_flight();
        Ok(())
    }

    /// Request cancellation of all in-flight downloads. Best-effort; each
    /// download cleans itself up once its transport call returns.
    pub fn cancel_all(&self) {
        self.coordinator.cancel_all();
    }
}

/// Whether an identifier refers to a remote resource this cache manages.
fn is_remote(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

fn format_size(size: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if size < MIB {
        format!("{}KB", size / 1024)
    } else {
        format!("{:.2}MB", size as f64 / MIB as f64)
    }
}
