//! CondDB Storage - Cache, Backends and Access Service
//!
//! Everything that holds state lives here: the validity cache, the backend
//! stores, the connection manager with its idle watchdog, the tag resolver,
//! the heartbeat tracker, and the [`CondDbAccessSvc`] façade that ties them
//! together. Data types come from `conddb-core`.

pub mod access;
pub mod backend;
pub mod cache;
pub mod connection;
pub mod heartbeat;
pub mod tag;

pub use access::{
    CondDbAccessSvc, CondDbCacheAccess, CondDbEditor, CondDbInfo, CondDbReader, NameTagPair,
    ServicePhase,
};
pub use backend::{
    backend_for, CondDbBackend, InMemoryCondDb, LmdbCondDb, LmdbError, NoDatabase,
};
pub use cache::{CacheEntry, CacheKey, CacheStats, CachedNode, ValidityCache};
pub use connection::ConnectionManager;
pub use heartbeat::HeartbeatTracker;
pub use tag::{AutoTagNamer, TagResolver, TagValidation};
