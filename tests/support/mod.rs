//! Test fixtures: a scripted in-memory driver and misbehaving cache backends.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlcache::cache::{CacheKey, CachePort, Item};
use sqlcache::{
    Column, Connection, Context, Driver, Error, ExecResult, Result, Row, Rows, Statement, Value,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const QUERY: &str = "-- @cache-ttl 30\n-- @cache-max-rows 1000\nSELECT a FROM t WHERE a > ?";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared state behind every connection of a [`MockDriver`].
///
/// Queries return the rows of a single-column table `t(a)` filtered by
/// `a > params[0]` (all rows when no parameter is bound).
#[derive(Default)]
pub struct MockDb {
    pub table: Mutex<Vec<i64>>,
    pub opens: AtomicUsize,
    pub prepares: AtomicUsize,
    pub executions: AtomicUsize,
    pub execs: AtomicUsize,
    pub open_cursors: AtomicUsize,
    pub statements_closed: AtomicUsize,
    pub latency: Mutex<Option<Duration>>,
    pub fail_query: Mutex<Option<String>>,
    pub fail_at_row: Mutex<Option<usize>>,
}

impl MockDb {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn fail_next_query(&self, message: &str) {
        *self.fail_query.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_at_row(&self, row: usize) {
        *self.fail_at_row.lock().unwrap() = Some(row);
    }

    async fn run(self: &Arc<Self>, params: &[Value]) -> Result<Box<dyn Rows>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = self.fail_query.lock().unwrap().take() {
            return Err(Error::driver(message));
        }
        let floor = params.first().and_then(Value::as_i64).unwrap_or(i64::MIN);
        let rows: VecDeque<Row> = self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|a| **a > floor)
            .map(|a| vec![Value::Int(*a)])
            .collect();
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRows {
            db: self.clone(),
            columns: vec![Column::new("a", "Int64").with_nullable(false)],
            rows,
            fetched: 0,
            fail_at: *self.fail_at_row.lock().unwrap(),
            closed: false,
        }))
    }
}

pub struct MockDriver {
    pub db: Arc<MockDb>,
}

impl MockDriver {
    pub fn with_rows(values: impl IntoIterator<Item = i64>) -> (Arc<dyn Driver>, Arc<MockDb>) {
        let db = Arc::new(MockDb::default());
        *db.table.lock().unwrap() = values.into_iter().collect();
        (Arc::new(MockDriver { db: db.clone() }), db)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, cx: &Context, _dsn: &str) -> Result<Box<dyn Connection>> {
        cx.check()?;
        self.db.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            db: self.db.clone(),
            closed: false,
        }))
    }
}

pub struct MockConnection {
    db: Arc<MockDb>,
    closed: bool,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::driver("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn prepare(&mut self, _cx: &Context, query: &str) -> Result<Box<dyn Statement>> {
        self.ensure_open()?;
        if query.contains("SYNTAX ERROR") {
            return Err(Error::driver("syntax error at or near \"ERROR\""));
        }
        self.db.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStatement {
            db: self.db.clone(),
            query: query.to_string(),
        }))
    }

    async fn query(&mut self, _cx: &Context, _query: &str, params: &[Value]) -> Result<Box<dyn Rows>> {
        self.ensure_open()?;
        self.db.run(params).await
    }

    async fn execute(&mut self, _cx: &Context, _query: &str, _params: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.db.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub struct MockStatement {
    db: Arc<MockDb>,
    query: String,
}

#[async_trait]
impl Statement for MockStatement {
    fn query_text(&self) -> &str {
        &self.query
    }

    fn num_params(&self) -> Option<usize> {
        Some(self.query.matches('?').count())
    }

    async fn query(&mut self, _cx: &Context, params: &[Value]) -> Result<Box<dyn Rows>> {
        self.db.run(params).await
    }

    async fn execute(&mut self, _cx: &Context, _params: &[Value]) -> Result<ExecResult> {
        self.db.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecResult::default())
    }

    async fn close(&mut self) -> Result<()> {
        self.db.statements_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockRows {
    db: Arc<MockDb>,
    columns: Vec<Column>,
    rows: VecDeque<Row>,
    fetched: usize,
    fail_at: Option<usize>,
    closed: bool,
}

impl MockRows {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Rows for MockRows {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next(&mut self, _cx: &Context) -> Result<Option<Row>> {
        if self.closed {
            return Err(Error::driver("rows are closed"));
        }
        if self.fail_at == Some(self.fetched) {
            return Err(Error::driver("connection reset while fetching"));
        }
        self.fetched += 1;
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockRows {
    fn drop(&mut self) {
        self.release();
    }
}

/// Backend whose writes always fail; reads fail too when `fail_get` is set.
#[derive(Default)]
pub struct FailingCache {
    pub fail_get: bool,
    pub sets: AtomicUsize,
}

#[async_trait]
impl CachePort for FailingCache {
    async fn get(&self, _cx: &Context, _key: &CacheKey) -> Result<Option<Arc<Item>>> {
        if self.fail_get {
            return Err(Error::cache("connection refused"));
        }
        Ok(None)
    }

    async fn set(&self, _cx: &Context, _key: &CacheKey, _item: Arc<Item>, _ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        Err(Error::cache("READONLY You can't write against a read only replica"))
    }

    async fn invalidate(&self, _cx: &Context, _key: &CacheKey) -> Result<()> {
        Err(Error::cache("connection refused"))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Read every row of `rows` as integers, then close it.
pub async fn read_ints(cx: &Context, rows: &mut dyn Rows) -> Result<Vec<i64>> {
    let all = sqlcache::drivers::collect(cx, rows).await?;
    Ok(all
        .into_iter()
        .map(|row| row[0].as_i64().unwrap_or_default())
        .collect())
}
