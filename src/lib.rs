//! # Pixcache
//!
//! A client-side content cache engine: `resolve(uri)` returns a path to a
//! locally persisted copy of a remote resource, fetching and storing it on
//! first access and serving later requests from disk.
//!
//! ## Features
//!
//! - Deterministic key derivation with a sharded directory layout
//! - Persisted identifier→path index, hydrated lazily and written through
//! - Single-flight deduplication of concurrent fetches for the same key
//! - Download-to-temp with atomic move-into-place
//! - Cache size accounting and full clear

pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod key;
pub mod manager;
pub mod persist;
pub mod store;
pub mod transport;

pub use config::{CacheConfig, DEFAULT_SHARD_COUNT};
pub use coordinator::FetchCoordinator;
pub use error::CacheError;
pub use index::CacheIndex;
pub use key::{DerivedKey, derive};
pub use manager::CacheManager;
pub use persist::{FileKvStore, KvStore};
pub use store::ShardedStore;
pub use transport::{FetchResponse, HttpTransport, Transport, create_client};
