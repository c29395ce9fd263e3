//! Per-key mutual exclusion around a cache backend.
//!
//! [`SyncCache`] serializes access to the *same* key while leaving distinct
//! keys fully concurrent. `get` and `invalidate` take the key's lock shared,
//! `set` takes it exclusive.
//!
//! Serializing access is not the same as serializing work: two callers that
//! both miss can still both execute upstream. Callers that need single-flight
//! population take a [`KeyGuard`] with [`SyncCache::lock`] and perform the
//! whole check, execute, populate sequence while holding it.

use super::backend::{CachePort, Item};
use super::key::CacheKey;
use crate::context::Context;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as KeyLock};
use tracing::trace;

pub const DEFAULT_LOCK_TABLE_CAPACITY: usize = 10_000;

/// Table of per-key locks.
///
/// Entries are created lazily and at most one lock exists per key. The table
/// is bounded: when full, idle entries (held by no caller) are dropped
/// oldest first. Lookups do not refresh an entry's position; an entry found
/// in use during eviction is requeued as the newest. Entries in use are never
/// dropped, so the table may briefly exceed its capacity under heavy
/// contention.
pub struct KeyLocks {
    table: RwLock<LruCache<String, Arc<KeyLock<()>>>>,
    capacity: usize,
}

impl KeyLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: RwLock::new(LruCache::unbounded()),
            capacity: capacity.max(1),
        }
    }

    fn poisoned() -> Error {
        Error::cache_with_context(
            "key lock table poisoned",
            ErrorContext::new().with_source("sync_cache"),
        )
    }

    fn entry(&self, key: &str) -> Result<Arc<KeyLock<()>>> {
        {
            let table = self.table.read().map_err(|_| Self::poisoned())?;
            if let Some(lock) = table.peek(key) {
                return Ok(lock.clone());
            }
        }

        let mut table = self.table.write().map_err(|_| Self::poisoned())?;
        // another caller may have inserted while we waited for the write lock
        if let Some(lock) = table.peek(key) {
            return Ok(lock.clone());
        }
        self.evict_idle(&mut table);
        let lock = Arc::new(KeyLock::new(()));
        table.put(key.to_string(), lock.clone());
        Ok(lock)
    }

    fn evict_idle(&self, table: &mut LruCache<String, Arc<KeyLock<()>>>) {
        let mut attempts = table.len();
        while table.len() >= self.capacity && attempts > 0 {
            attempts -= 1;
            let Some((key, lock)) = table.pop_lru() else {
                break;
            };
            if Arc::strong_count(&lock) > 1 {
                table.put(key, lock);
            } else {
                trace!(key = %key, "evicted idle key lock");
            }
        }
    }

    pub async fn read(&self, cx: &Context, key: &CacheKey) -> Result<OwnedRwLockReadGuard<()>> {
        let lock = self.entry(key.as_str())?;
        cx.run(lock.read_owned()).await
    }

    pub async fn write(&self, cx: &Context, key: &CacheKey) -> Result<OwnedRwLockWriteGuard<()>> {
        let lock = self.entry(key.as_str())?;
        cx.run(lock.write_owned()).await
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Stampede-safe decorator over any [`CachePort`].
#[derive(Clone)]
pub struct SyncCache {
    inner: Arc<dyn CachePort>,
    locks: Arc<KeyLocks>,
}

impl SyncCache {
    pub fn new(inner: Arc<dyn CachePort>) -> Self {
        Self::with_capacity(inner, DEFAULT_LOCK_TABLE_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn CachePort>, lock_table_capacity: usize) -> Self {
        Self {
            inner,
            locks: Arc::new(KeyLocks::new(lock_table_capacity)),
        }
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Hold `key` exclusively until the returned guard is dropped.
    pub async fn lock(&self, cx: &Context, key: &CacheKey) -> Result<KeyGuard> {
        let guard = self.locks.write(cx, key).await?;
        Ok(KeyGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            _guard: guard,
        })
    }
}

#[async_trait]
impl CachePort for SyncCache {
    async fn get(&self, cx: &Context, key: &CacheKey) -> Result<Option<Arc<Item>>> {
        let _guard = self.locks.read(cx, key).await?;
        cx.try_run(self.inner.get(cx, key)).await
    }

    async fn set(
        &self,
        cx: &Context,
        key: &CacheKey,
        item: Arc<Item>,
        ttl: Duration,
    ) -> Result<()> {
        let _guard = self.locks.write(cx, key).await?;
        cx.try_run(self.inner.set(cx, key, item, ttl)).await
    }

    async fn invalidate(&self, cx: &Context, key: &CacheKey) -> Result<()> {
        let _guard = self.locks.read(cx, key).await?;
        cx.try_run(self.inner.invalidate(cx, key)).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Exclusive hold on one key.
///
/// Operations go straight to the wrapped backend; the key is already locked.
pub struct KeyGuard {
    inner: Arc<dyn CachePort>,
    key: CacheKey,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub async fn get(&self, cx: &Context) -> Result<Option<Arc<Item>>> {
        cx.try_run(self.inner.get(cx, &self.key)).await
    }

    pub async fn set(&self, cx: &Context, item: Arc<Item>, ttl: Duration) -> Result<()> {
        cx.try_run(self.inner.set(cx, &self.key, item, ttl)).await
    }

    pub async fn invalidate(&self, cx: &Context) -> Result<()> {
        cx.try_run(self.inner.invalidate(cx, &self.key)).await
    }
}
