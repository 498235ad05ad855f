//! # Cache Index
//!
//! Persisted mapping from original resource identifiers to resolved cache
//! file paths. Hydrated lazily from the backing [`KvStore`] once per process
//! and held in memory; every mutation is written through synchronously.
//! Persistence failures are logged and swallowed, leaving the in-memory view
//! authoritative for the rest of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persist::KvStore;

/// Storage key the serialized index lives under.
pub const STORAGE_KEY: &str = "cache-image-entity";

/// Wire shape of the persisted index. Unknown fields are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheEntity {
    #[serde(rename = "cacheMap", default)]
    cache_map: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct IndexState {
    map: HashMap<String, String>,
    fresh: bool,
}

pub struct CacheIndex {
    store: Arc<dyn KvStore>,
    state: Mutex<IndexState>,
}

impl CacheIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Hydrate the in-memory map from the persisted store if this has not
    /// happened yet this process lifetime. A missing or unparseable record
    /// starts the index empty; neither is fatal.
    pub async fn ensure_fresh(&self) {
        if self.state.lock().fresh {
            return;
        }

        let map = match self.store.get(STORAGE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntity>(&bytes) {
                Ok(entity) => entity.cache_map,
                Err(e) => {
                    warn!(error = %e, "Failed to parse persisted cache index, starting empty");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted cache index, starting empty");
                HashMap::new()
            }
        };

        let mut state = self.state.lock();
        if !state.fresh {
            state.map = map;
            state.fresh = true;
        }
    }

    /// Look up the resolved path for an identifier.
    pub async fn lookup(&self, original_key: &str) -> Option<PathBuf> {
        self.ensure_fresh().await;
        self.state.lock().map.get(original_key).map(PathBuf::from)
    }

    /// Record a resolved path for an identifier and write the whole index
    /// through to the persisted store.
    pub async fn put(&self, original_key: &str, resolved_path: &Path) {
        self.ensure_fresh().await;

        let snapshot = {
            let mut state = self.state.lock();
            state.map.insert(
                original_key.to_owned(),
                resolved_path.to_string_lossy().into_owned(),
            );
            state.map.clone()
        };

        self.persist(snapshot).await;
    }

    /// Clear the in-memory map and persist the empty index. The freshness
    /// flag stays set: the cleared view is the current truth.
    pub async fn reset_and_persist(&self) {
        {
            let mut state = self.state.lock();
            state.map.clear();
            state.fresh = true;
        }
        self.persist(HashMap::new()).await;
    }

    async fn persist(&self, map: HashMap<String, String>) {
        let entity = CacheEntity { cache_map: map };
        let bytes = match serde_json::to_vec(&entity) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache index");
                return;
            }
        };
        if let Err(e) = self.store.set(STORAGE_KEY, &bytes).await {
            warn!(error = %e, "Failed to persist cache index");
        }
    }

    #[cfg(test)]
    pub(crate) fn invalidate_for_test(&self) {
        let mut state = self.state.lock();
        state.fresh = false;
        state.map.clear();
    }
}
