//! # Fetch Coordinator
//!
//! Deduplicates concurrent fetches for the same identifier. The first caller
//! for an identifier becomes the driver: it downloads to a temp file, moves
//! the result into the sharded store and updates the index. Callers arriving
//! while a download is in flight attach a waiter and are woken with the
//! driver's outcome, success or failure. At most one concurrent download per
//! identifier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::index::CacheIndex;
use crate::key;
use crate::store::ShardedStore;
use crate::transport::Transport;

/// Per-identifier in-flight download state
struct InFlight {
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<Option<PathBuf>>>,
}

/// What a call to [`FetchCoordinator::request`] turned out to be.
enum Role {
    Driver(CancellationToken),
    Waiter(oneshot::Receiver<Option<PathBuf>>),
}

pub struct FetchCoordinator {
    transport: Arc<dyn Transport>,
    store: ShardedStore,
    index: Arc<CacheIndex>,
    shard_count: u32,
    overwrite: bool,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl FetchCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: ShardedStore,
        index: Arc<CacheIndex>,
        shard_count: u32,
        overwrite: bool,
    ) -> Self {
        Self {
            transport,
            store,
            index,
            shard_count,
            overwrite,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `uri` into the cache, deduplicating against any download of the
    /// same identifier already in flight. Returns the resolved cache path.
    pub async fn request(&self, uri: &str) -> Result<PathBuf, CacheError> {
        // Check-then-insert on the in-flight table must not be interrupted
        // by a suspension point, so it happens under one lock acquisition.
        let role = {
            let mut table = self.in_flight.lock();
            match table.get_mut(uri) {
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    Role::Waiter(rx)
                }
                None => {
                    let cancel = CancellationToken::new();
                    table.insert(
                        uri.to_owned(),
                        InFlight {
                            cancel: cancel.clone(),
                            waiters: Vec::new(),
                        },
                    );
                    Role::Driver(cancel)
                }
            }
        };

        match role {
            Role::Waiter(rx) => match rx.await {
                Ok(Some(path)) => Ok(path),
                Ok(None) => Err(CacheError::Interrupted(format!(
                    "download of {uri} failed"
                ))),
                // The in-flight entry was dropped without a broadcast, e.g.
                // by a cache clear racing this download.
                Err(_) => Err(CacheError::Interrupted(format!(
                    "download of {uri} was dropped"
                ))),
            },
            Role::Driver(cancel) => {
                let result = self.drive(uri, cancel).await;

                // The index update above happens-before this broadcast, so
                // every waiter observes a consistent index when it wakes.
                let entry = self.in_flight.lock().remove(uri);
                if let Some(entry) = entry {
                    let outcome = result.as_ref().ok().cloned();
                    for waiter in entry.waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                }
                result
            }
        }
    }

    /// Perform the actual download for `uri`: temp file, transport fetch,
    /// extension sniff, move into place, index update.
    async fn drive(&self, uri: &str, cancel: CancellationToken) -> Result<PathBuf, CacheError> {
        let derived = key::derive(uri, self.shard_count);
        let temp_path = self.store.temp_path(&derived.key);
        self.store.ensure_dir(&self.store.tmp_dir()).await;

        let response = self.transport.fetch(uri, &temp_path, cancel).await?;

        let extension = response.extension();
        let final_path = self.store.final_path(derived.shard, &derived.key, extension);

        let existed = self
            .store
            .move_into_place(&temp_path, &final_path, self.overwrite)
            .await?;
        if existed {
            debug!(uri = %uri, path = ?final_path, "Cache file already present, keeping it");
        }

        // Index the path regardless of whether the move created a new file
        // or found one existing; the index stays authoritative either way.
        self.index.put(uri, &final_path).await;

        Ok(final_path)
    }

    /// Request cancellation of every in-flight download. Best-effort and
    /// advisory: each driver cleans up its own entry once its transport
    /// call resolves.
    pub fn cancel_all(&self) {
        let table = self.in_flight.lock();
        for (uri, entry) in table.iter() {
            debug!(uri = %uri, "Cancelling in-flight download");
            entry.cancel.cancel();
        }
    }

    /// Drop all in-flight tracking without cancelling the underlying
    /// transport calls. Pending waiters are woken with an error rather than
    /// left hanging.
    pub fn drop_in_flight(&self) {
        let mut table = self.in_flight.lock();
        if !table.is_empty() {
            warn!(count = table.len(), "Dropping in-flight download entries");
        }
        table.clear();
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::FileKvStore;
    use crate::transport::FetchResponse;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// Test transport writing a fixed body, optionally parking on a gate
    /// until released so concurrent callers can pile up.
    struct MockTransport {
        body: Vec<u8>,
        content_type: Option<String>,
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl MockTransport {
        fn ok(content_type: &str) -> Self {
            Self {
                body: b"imagedata".to_vec(),
                content_type: Some(content_type.to_string()),
                fetches: AtomicUsize::new(0),
                gate: None,
                fail: false,
            }
        }

        fn gated(content_type: &str, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::ok(content_type)
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            cancel: CancellationToken,
        ) -> Result<FetchResponse, CacheError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if self.fail {
                return Err(CacheError::StatusCode(reqwest::StatusCode::NOT_FOUND));
            }
            tokio::fs::write(dest, &self.body).await?;
            Ok(FetchResponse {
                content_type: self.content_type.clone(),
            })
        }
    }

    fn coordinator_with(
        root: &Path,
        transport: Arc<MockTransport>,
    ) -> (Arc<FetchCoordinator>, Arc<CacheIndex>) {
        let store = ShardedStore::new(root.join("cache-images"));
        let index = Arc::new(CacheIndex::new(Arc::new(FileKvStore::new(
            root.to_path_buf(),
        ))));
        let coordinator = Arc::new(FetchCoordinator::new(
            transport,
            store,
            index.clone(),
            17,
            false,
        ));
        (coordinator, index)
    }

    #[tokio::test]
    async fn fetch_stores_at_derived_path_and_indexes() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MockTransport::ok("image/webp"));
        let (coordinator, index) = coordinator_with(dir.path(), transport.clone());

        let uri = "https://x/a.png";
        let path = coordinator.request(uri).await.unwrap();

        let derived = key::derive(uri, 17);
        let expected = dir
            .path()
            .join("cache-images")
            .join(derived.shard.to_string())
            .join(format!("{}.webp", derived.key));
        assert_eq!(path, expected);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"imagedata");
        assert_eq!(index.lookup(uri).await, Some(path));
        assert_eq!(transport.fetch_count(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn single_flight_dedups_concurrent_requests() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(MockTransport::gated("image/png", gate.clone()));
        let (coordinator, _) = coordinator_with(dir.path(), transport.clone());

        let uri = "https://x/a.png";
        let c1 = coordinator.clone();
        let first = tokio::spawn(async move { c1.request(uri).await });
        // Let the driver reach the gate before the second request arrives.
        tokio::task::yield_now().await;
        let c2 = coordinator.clone();
        let second = tokio::spawn(async move { c2.request(uri).await });
        tokio::task::yield_now().await;

        gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.fetch_count(), 1, "exactly one transport fetch");
    }

    #[tokio::test]
    async fn distinct_uris_download_independently() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MockTransport::ok("image/png"));
        let (coordinator, _) = coordinator_with(dir.path(), transport.clone());

        let a = coordinator.request("https://x/a.png").await.unwrap();
        let b = coordinator.request("https://x/b.png").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn failure_is_broadcast_to_waiters() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(MockTransport {
            fail: true,
            ..MockTransport::gated("image/png", gate.clone())
        });
        let (coordinator, index) = coordinator_with(dir.path(), transport.clone());

        let uri = "https://x/broken.png";
        let c1 = coordinator.clone();
        let driver = tokio::spawn(async move { c1.request(uri).await });
        tokio::task::yield_now().await;
        let c2 = coordinator.clone();
        let waiter = tokio::spawn(async move { c2.request(uri).await });
        tokio::task::yield_now().await;

        gate.notify_one();

        assert!(driver.await.unwrap().is_err());
        // The waiter is woken with an error instead of hanging.
        assert!(waiter.await.unwrap().is_err());
        assert!(index.lookup(uri).await.is_none(), "failed fetch is not indexed");
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn existing_file_is_kept_and_still_indexed() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MockTransport::ok("image/png"));
        let (coordinator, index) = coordinator_with(dir.path(), transport.clone());

        let uri = "https://x/a.png";
        let derived = key::derive(uri, 17);
        let store = ShardedStore::new(dir.path().join("cache-images"));
        let final_path = store.final_path(derived.shard, &derived.key, "png");
        store.ensure_dir(final_path.parent().unwrap()).await;
        tokio::fs::write(&final_path, b"preexisting").await.unwrap();

        let path = coordinator.request(uri).await.unwrap();

        assert_eq!(path, final_path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"preexisting");
        assert_eq!(index.lookup(uri).await, Some(final_path));
    }

    #[tokio::test]
    async fn cancel_all_aborts_in_flight_download() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(MockTransport::gated("image/png", gate));
        let (coordinator, _) = coordinator_with(dir.path(), transport.clone());

        let c1 = coordinator.clone();
        let driver = tokio::spawn(async move { c1.request("https://x/slow.png").await });
        tokio::task::yield_now().await;

        coordinator.cancel_all();

        let result = driver.await.unwrap();
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn dropped_entries_wake_waiters_with_error() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(MockTransport::gated("image/png", gate.clone()));
        let (coordinator, _) = coordinator_with(dir.path(), transport.clone());

        let uri = "https://x/a.png";
        let c1 = coordinator.clone();
        let driver = tokio::spawn(async move { c1.request(uri).await });
        tokio::task::yield_now().await;
        let c2 = coordinator.clone();
        let waiter = tokio::spawn(async move { c2.request(uri).await });
        tokio::task::yield_now().await;

        coordinator.drop_in_flight();
        gate.notify_one();

        // The driver still completes its own download.
        assert!(driver.await.unwrap().is_ok());
        // The waiter's channel was dropped with the entry.
        assert!(waiter.await.unwrap().is_err());
    }
}
