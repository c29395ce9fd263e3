//! 数据库驱动抽象层 — 通过 trait 实现对任意 SQL 驱动的透明代理
//!
//! Driver abstraction layer: the open → prepare → execute → fetch contract a
//! wrapped database driver implements, and that the caching proxy implements
//! in turn. Uses `Box<dyn ...>` objects for runtime polymorphism so the same
//! application code works with a real driver or a cached one.
//!
//! End of results is `Ok(None)` from [`Rows::next`]; `Err` is always a genuine
//! fault. Dropping a connection, statement or cursor must release it; `close`
//! exists to surface errors from the release.

use async_trait::async_trait;

use crate::context::Context;
use crate::types::{Column, ExecResult, Row, Value};
use crate::Result;

/// Entry point of a database driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver identifier, for logs.
    fn name(&self) -> &str;

    async fn open(&self, cx: &Context, dsn: &str) -> Result<Box<dyn Connection>>;
}

/// An open connection. Used by one caller at a time.
#[async_trait]
pub trait Connection: Send {
    async fn prepare(&mut self, cx: &Context, query: &str) -> Result<Box<dyn Statement>>;

    /// Run a row-returning query without an explicit prepare step.
    async fn query(&mut self, cx: &Context, query: &str, params: &[Value])
        -> Result<Box<dyn Rows>>;

    /// Run a statement that returns no rows.
    async fn execute(&mut self, cx: &Context, query: &str, params: &[Value])
        -> Result<ExecResult>;

    async fn ping(&mut self, cx: &Context) -> Result<()> {
        cx.check()
    }

    async fn close(&mut self) -> Result<()>;
}

/// A prepared statement.
#[async_trait]
pub trait Statement: Send {
    /// The query text this statement was prepared from.
    fn query_text(&self) -> &str;

    /// Number of placeholders, when the driver knows it.
    fn num_params(&self) -> Option<usize> {
        None
    }

    async fn query(&mut self, cx: &Context, params: &[Value]) -> Result<Box<dyn Rows>>;

    async fn execute(&mut self, cx: &Context, params: &[Value]) -> Result<ExecResult>;

    async fn close(&mut self) -> Result<()>;
}

/// A forward-only result cursor.
#[async_trait]
pub trait Rows: Send {
    fn columns(&self) -> &[Column];

    /// Fetch the next row; `Ok(None)` once the results are exhausted.
    async fn next(&mut self, cx: &Context) -> Result<Option<Row>>;

    async fn close(&mut self) -> Result<()>;
}

/// Drain a cursor into memory and close it.
pub async fn collect(cx: &Context, rows: &mut dyn Rows) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    let drained: Result<()> = async {
        while let Some(row) = rows.next(cx).await? {
            out.push(row);
        }
        Ok(())
    }
    .await;
    let closed = rows.close().await;
    drained.and(closed)?;
    Ok(out)
}
