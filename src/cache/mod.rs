//! 结果集缓存模块：可插拔的缓存后端、缓存键生成与按键互斥。
//!
//! # Result-Set Caching Module
//!
//! This module holds everything the interceptor needs from a cache: the
//! backend contract, the value stored under each key, key derivation, and the
//! stampede-safe decorator that arbitrates concurrent access per key.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CachePort`] | Trait every storage backend implements (get/set/invalidate) |
//! | [`Item`] | Immutable snapshot of a result set (columns + rows) |
//! | [`MemoryCache`] | Bounded in-memory backend with a row budget and TTL |
//! | [`NullCache`] | No-op backend for disabling caching |
//! | [`SyncCache`] | Per-key locking decorator over any backend |
//! | [`CacheKey`] | Opaque key derived from query text and parameters |
//!
//! ## Example
//!
//! ```rust
//! use sqlcache::cache::{CachePort, MemoryCache, SyncCache};
//! use std::sync::Arc;
//!
//! // Up to 10 000 cached rows, guarded per key
//! let cache = SyncCache::new(Arc::new(MemoryCache::new(10_000)));
//! assert_eq!(cache.name(), "memory");
//! ```
//!
//! ## Cache Key Generation
//!
//! Keys hash the query text with its directive comments stripped together
//! with the ordered bound parameters, so the same statement with different
//! arguments never shares an entry.

mod backend;
mod key;
mod sync;

pub use backend::{CachePort, Item, MemoryCache, NullCache};
pub use key::{CacheKey, KeyGenerator};
pub use sync::{KeyGuard, KeyLocks, SyncCache, DEFAULT_LOCK_TABLE_CAPACITY};
