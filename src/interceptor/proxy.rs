//! Proxy objects standing in for the wrapped driver, and the per-query
//! decision logic they share.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::rows::{drain, Drained, ReplayRows};
use super::stats::AtomicStats;
use super::Settings;
use crate::cache::{CacheKey, CachePort, Item, KeyGenerator, KeyGuard, SyncCache};
use crate::context::Context;
use crate::directive::{self, Attributes};
use crate::drivers::{Connection, Driver, Rows, Statement};
use crate::types::{ExecResult, Value};
use crate::{Error, Result};

pub(crate) struct Shared {
    pub(crate) cache: SyncCache,
    pub(crate) keys: KeyGenerator,
    pub(crate) stats: AtomicStats,
    pub(crate) settings: Settings,
}

/// Where a miss gets its rows from.
enum Upstream<'a> {
    Connection {
        conn: &'a mut dyn Connection,
        query: &'a str,
    },
    Statement(&'a mut dyn Statement),
}

impl Upstream<'_> {
    async fn query(self, cx: &Context, params: &[Value]) -> Result<Box<dyn Rows>> {
        match self {
            Upstream::Connection { conn, query } => cx.try_run(conn.query(cx, query, params)).await,
            Upstream::Statement(stmt) => cx.try_run(stmt.query(cx, params)).await,
        }
    }
}

impl Shared {
    async fn query(
        &self,
        cx: &Context,
        upstream: Upstream<'_>,
        query: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>> {
        let Some(attrs) = self.policy(query) else {
            return upstream.query(cx, params).await;
        };
        let key = match self.keys.generate(query, params) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "cannot derive cache key, bypassing cache");
                self.stats.record_error();
                self.stats.record_bypass();
                return upstream.query(cx, params).await;
            }
        };

        if let Some(item) = self.lookup(cx, &key).await? {
            return Ok(self.replay(&key, item));
        }

        if !self.settings.single_flight {
            return self.fill(cx, upstream, params, attrs, &key, None).await;
        }
        let guard = match self.cache.lock(cx, &key).await {
            Ok(guard) => guard,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                self.cache_fault(&key, "lock", &err);
                return self.fill(cx, upstream, params, attrs, &key, None).await;
            }
        };
        // somebody may have populated the key while we waited
        match guard.get(cx).await {
            Ok(Some(item)) => return Ok(self.replay(&key, item)),
            Ok(None) => {}
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => self.cache_fault(&key, "get", &err),
        }
        self.fill(cx, upstream, params, attrs, &key, Some(&guard))
            .await
    }

    /// Cache policy for `query`, or `None` when it must bypass the cache.
    fn policy(&self, query: &str) -> Option<Attributes> {
        if !self.settings.enabled {
            self.stats.record_bypass();
            return None;
        }
        match directive::parse(query) {
            Ok(Some(attrs)) => Some(attrs),
            Ok(None) => {
                self.stats.record_bypass();
                None
            }
            Err(err) => {
                warn!(error = %err, "ignoring malformed cache directive");
                self.stats.record_error();
                self.stats.record_bypass();
                None
            }
        }
    }

    /// Fail-open lookup: backend faults read as misses.
    async fn lookup(&self, cx: &Context, key: &CacheKey) -> Result<Option<Arc<Item>>> {
        match self.cache.get(cx, key).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                self.cache_fault(key, "get", &err);
                Ok(None)
            }
        }
    }

    fn replay(&self, key: &CacheKey, item: Arc<Item>) -> Box<dyn Rows> {
        self.stats.record_hit();
        debug!(key = %key, rows = item.len(), "serving cached result");
        Box::new(ReplayRows::new(item))
    }

    /// Execute upstream, then store the result if it fits the row cap.
    async fn fill(
        &self,
        cx: &Context,
        upstream: Upstream<'_>,
        params: &[Value],
        attrs: Attributes,
        key: &CacheKey,
        guard: Option<&KeyGuard>,
    ) -> Result<Box<dyn Rows>> {
        self.stats.record_miss();
        let live = upstream.query(cx, params).await?;
        match drain(cx, live, attrs.max_rows).await? {
            Drained::Complete(item) => {
                let item = Arc::new(item);
                let stored = match guard {
                    Some(guard) => guard.set(cx, item.clone(), attrs.ttl()).await,
                    None => self.cache.set(cx, key, item.clone(), attrs.ttl()).await,
                };
                match stored {
                    Ok(()) => {
                        debug!(key = %key, rows = item.len(), ttl = attrs.ttl, "populated cache")
                    }
                    Err(err) if err.is_cancellation() => return Err(err),
                    Err(err) => self.cache_fault(key, "set", &err),
                }
                Ok(Box::new(ReplayRows::new(item)))
            }
            Drained::Overflow(rows) => {
                self.stats.record_oversized();
                debug!(key = %key, max_rows = attrs.max_rows, "result exceeds row cap, not caching");
                Ok(Box::new(rows))
            }
        }
    }

    fn cache_fault(&self, key: &CacheKey, op: &'static str, err: &Error) {
        self.stats.record_error();
        warn!(key = %key, op, backend = self.cache.name(), error = %err, "cache backend error");
    }
}

/// Driver wrapper returned by [`Interceptor::driver`](super::Interceptor::driver).
pub struct CachedDriver {
    inner: Arc<dyn Driver>,
    shared: Arc<Shared>,
}

impl CachedDriver {
    pub(crate) fn new(inner: Arc<dyn Driver>, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }
}

#[async_trait]
impl Driver for CachedDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open(&self, cx: &Context, dsn: &str) -> Result<Box<dyn Connection>> {
        let inner = cx.try_run(self.inner.open(cx, dsn)).await?;
        Ok(Box::new(CachedConnection {
            inner,
            shared: self.shared.clone(),
        }))
    }
}

/// Connection proxy. Everything but row-returning queries is forwarded as is.
pub struct CachedConnection {
    inner: Box<dyn Connection>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for CachedConnection {
    async fn prepare(&mut self, cx: &Context, query: &str) -> Result<Box<dyn Statement>> {
        let inner = cx.try_run(self.inner.prepare(cx, query)).await?;
        Ok(Box::new(CachedStatement {
            query: query.to_string(),
            inner,
            shared: self.shared.clone(),
        }))
    }

    async fn query(
        &mut self,
        cx: &Context,
        query: &str,
        params: &[Value],
    ) -> Result<Box<dyn Rows>> {
        let upstream = Upstream::Connection {
            conn: self.inner.as_mut(),
            query,
        };
        self.shared.query(cx, upstream, query, params).await
    }

    async fn execute(
        &mut self,
        cx: &Context,
        query: &str,
        params: &[Value],
    ) -> Result<ExecResult> {
        cx.try_run(self.inner.execute(cx, query, params)).await
    }

    async fn ping(&mut self, cx: &Context) -> Result<()> {
        cx.try_run(self.inner.ping(cx)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Prepared-statement proxy.
pub struct CachedStatement {
    query: String,
    inner: Box<dyn Statement>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Statement for CachedStatement {
    fn query_text(&self) -> &str {
        &self.query
    }

    fn num_params(&self) -> Option<usize> {
        self.inner.num_params()
    }

    async fn query(&mut self, cx: &Context, params: &[Value]) -> Result<Box<dyn Rows>> {
        let upstream = Upstream::Statement(self.inner.as_mut());
        self.shared.query(cx, upstream, &self.query, params).await
    }

    async fn execute(&mut self, cx: &Context, params: &[Value]) -> Result<ExecResult> {
        cx.try_run(self.inner.execute(cx, params)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
