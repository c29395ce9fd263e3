//! Cache port and the bundled backend implementations.

use super::key::CacheKey;
use crate::context::Context;
use crate::types::{Column, Row};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Materialized snapshot of a result set.
///
/// Items are shared behind an `Arc` once stored and never mutated; a refresh
/// stores a new item under the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Item {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cost charged against a row-budgeted backend; empty results still cost one.
    pub fn cost(&self) -> usize {
        self.rows.len().max(1)
    }
}

/// Minimal contract every storage backend satisfies.
///
/// `get` returning `Ok(None)` means absent or expired. Errors are backend
/// faults; callers treat them as misses. Once `set` returns `Ok` for a key, a
/// later `get` of that key observes the new item.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, cx: &Context, key: &CacheKey) -> Result<Option<Arc<Item>>>;
    async fn set(&self, cx: &Context, key: &CacheKey, item: Arc<Item>, ttl: Duration)
        -> Result<()>;
    /// Remove `key` if present; absence is not an error.
    async fn invalidate(&self, cx: &Context, key: &CacheKey) -> Result<()>;
    fn name(&self) -> &'static str;
}

struct CacheEntry {
    item: Arc<Item>,
    cost: usize,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(item: Arc<Item>, ttl: Duration) -> Self {
        Self {
            cost: item.cost(),
            item,
            created_at: Instant::now(),
            ttl,
        }
    }

    // ttl of zero never expires
    fn is_expired(&self) -> bool {
        !self.ttl.is_zero() && self.created_at.elapsed() > self.ttl
    }
}

struct MemoryState {
    entries: LruCache<String, CacheEntry>,
    cost: usize,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.cost -= entry.cost;
        Some(entry)
    }
}

/// Bounded in-memory cache.
///
/// Capacity is a budget of cached rows rather than entries, so a handful of
/// large result sets cannot crowd the process. Least-recently-used entries are
/// evicted to make room; an item bigger than the whole budget is not stored.
/// A `ttl` of zero caches indefinitely.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_cost: usize,
}

impl MemoryCache {
    pub fn new(max_cost: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                cost: 0,
            }),
            max_cost,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            Error::cache_with_context(
                "MemoryCache poisoned",
                ErrorContext::new().with_source("memory_cache"),
            )
        })
    }

    /// Number of live (possibly expired, not yet collected) entries.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows currently charged against the budget.
    pub fn cost(&self) -> usize {
        self.state.lock().map(|s| s.cost).unwrap_or(0)
    }

    pub fn max_cost(&self) -> usize {
        self.max_cost
    }
}

#[async_trait]
impl CachePort for MemoryCache {
    async fn get(&self, cx: &Context, key: &CacheKey) -> Result<Option<Arc<Item>>> {
        cx.check()?;
        let mut state = self.state()?;
        let expired = match state.entries.get(key.as_str()) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.item.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key.as_str());
        }
        Ok(None)
    }

    async fn set(
        &self,
        cx: &Context,
        key: &CacheKey,
        item: Arc<Item>,
        ttl: Duration,
    ) -> Result<()> {
        cx.check()?;
        let mut state = self.state()?;
        state.remove(key.as_str());

        let entry = CacheEntry::new(item, ttl);
        if entry.cost > self.max_cost {
            return Ok(());
        }
        while state.cost + entry.cost > self.max_cost {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.cost -= evicted.cost,
                None => break,
            }
        }
        state.cost += entry.cost;
        state.entries.put(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn invalidate(&self, cx: &Context, key: &CacheKey) -> Result<()> {
        cx.check()?;
        self.state()?.remove(key.as_str());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend that never stores anything; every lookup misses.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachePort for NullCache {
    async fn get(&self, _: &Context, _: &CacheKey) -> Result<Option<Arc<Item>>> {
        Ok(None)
    }
    async fn set(&self, _: &Context, _: &CacheKey, _: Arc<Item>, _: Duration) -> Result<()> {
        Ok(())
    }
    async fn invalidate(&self, _: &Context, _: &CacheKey) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
