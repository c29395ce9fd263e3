//! 查询拦截器：在应用与真实驱动之间透明地提供结果集缓存。
//!
//! # Query Interceptor
//!
//! [`Interceptor`] wraps a real [`Driver`] and returns a [`CachedDriver`]
//! implementing the very same contract. Each row-returning query goes through
//! the same decision sequence:
//!
//! 1. Parse `@cache-ttl` / `@cache-max-rows` directives. None, or malformed
//!    ones, mean the query runs upstream untouched (a *bypass*).
//! 2. Derive the cache key from the stripped query text and bound parameters.
//! 3. Look the key up. A hit is replayed from memory without touching the
//!    driver.
//! 4. On a miss, take the key's exclusive lock, re-check, execute upstream,
//!    drain the cursor, store it when it fits the row cap, and replay it.
//!
//! Caching is best effort: directive and cache backend failures are counted
//! in [`Stats`] and never fail a query. Driver errors always reach the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlcache::{Config, Interceptor, MemoryCache};
//! use std::sync::Arc;
//!
//! let interceptor = Interceptor::new(Config::new(Arc::new(MemoryCache::new(1000))))?;
//! let driver = interceptor.driver(real_driver);
//! let mut conn = driver.open(&cx, "tcp://localhost:9000").await?;
//! let rows = conn
//!     .query(&cx, "-- @cache-ttl 30\n-- @cache-max-rows 1000\nSELECT user FROM example", &[])
//!     .await?;
//! println!("{}", interceptor.stats());
//! ```

mod proxy;
mod rows;
mod stats;

pub use proxy::{CachedConnection, CachedDriver, CachedStatement};
pub use rows::{PassthroughRows, ReplayRows};
pub use stats::Stats;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{CachePort, KeyGenerator, SyncCache, DEFAULT_LOCK_TABLE_CAPACITY};
use crate::context::Context;
use crate::drivers::Driver;
use crate::types::Value;
use crate::{Error, ErrorContext, Result};
use proxy::Shared;
use stats::AtomicStats;

/// Tunables for an [`Interceptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// When false every query bypasses the cache.
    pub enabled: bool,
    /// Hold the key's exclusive lock across miss, upstream execution and
    /// population so concurrent identical misses run upstream once.
    pub single_flight: bool,
    /// Upper bound on idle per-key lock entries.
    pub lock_table_capacity: usize,
    /// Namespace prepended to every cache key.
    pub key_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            single_flight: true,
            lock_table_capacity: DEFAULT_LOCK_TABLE_CAPACITY,
            key_prefix: None,
        }
    }
}

impl Settings {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_table_capacity == 0 {
            return Err(Error::configuration_with_context(
                "lock table capacity must be greater than zero",
                ErrorContext::new()
                    .with_field_path("settings.lock_table_capacity")
                    .with_source("interceptor"),
            ));
        }
        Ok(())
    }
}

/// Interceptor configuration: the cache backend plus [`Settings`].
#[derive(Clone)]
pub struct Config {
    pub cache: Arc<dyn CachePort>,
    pub settings: Settings,
}

impl Config {
    pub fn new(cache: Arc<dyn CachePort>) -> Self {
        Self {
            cache,
            settings: Settings::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.settings.enabled = enabled;
        self
    }

    pub fn with_single_flight(mut self, single_flight: bool) -> Self {
        self.settings.single_flight = single_flight;
        self
    }

    pub fn with_lock_table_capacity(mut self, capacity: usize) -> Self {
        self.settings.lock_table_capacity = capacity;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.key_prefix = Some(prefix.into());
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("cache", &self.cache.name())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Caching layer shared by every driver it wraps.
///
/// Cloning is cheap and clones share counters and lock table.
#[derive(Clone)]
pub struct Interceptor {
    shared: Arc<Shared>,
}

impl Interceptor {
    pub fn new(config: Config) -> Result<Self> {
        config.settings.validate()?;
        let Config { cache, settings } = config;

        let mut keys = KeyGenerator::new();
        if let Some(ref prefix) = settings.key_prefix {
            keys = keys.with_prefix(prefix.clone());
        }
        Ok(Self {
            shared: Arc::new(Shared {
                cache: SyncCache::with_capacity(cache, settings.lock_table_capacity),
                keys,
                stats: AtomicStats::default(),
                settings,
            }),
        })
    }

    /// Wrap `driver`; the result is a drop-in replacement for it.
    pub fn driver(&self, driver: Arc<dyn Driver>) -> CachedDriver {
        CachedDriver::new(driver, self.shared.clone())
    }

    pub fn stats(&self) -> Stats {
        self.shared.stats.snapshot()
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Drop the cached result of `query` run with `params`, if any.
    pub async fn invalidate(&self, cx: &Context, query: &str, params: &[Value]) -> Result<()> {
        let key = self.shared.keys.generate(query, params)?;
        self.shared.cache.invalidate(cx, &key).await
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("cache", &self.shared.cache.name())
            .field("settings", &self.shared.settings)
            .field("stats", &self.stats())
            .finish()
    }
}
