//! Cursors handed back by the proxy.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::Item;
use crate::context::Context;
use crate::drivers::Rows;
use crate::types::{Column, Row};
use crate::Result;

/// Forward-only cursor over a cached [`Item`]. Never touches the database.
pub struct ReplayRows {
    item: Arc<Item>,
    pos: usize,
    closed: bool,
}

impl ReplayRows {
    pub fn new(item: Arc<Item>) -> Self {
        Self {
            item,
            pos: 0,
            closed: false,
        }
    }

    pub fn remaining(&self) -> usize {
        if self.closed {
            0
        } else {
            self.item.len() - self.pos
        }
    }
}

#[async_trait]
impl Rows for ReplayRows {
    fn columns(&self) -> &[Column] {
        &self.item.columns
    }

    async fn next(&mut self, cx: &Context) -> Result<Option<Row>> {
        cx.check()?;
        if self.closed {
            return Ok(None);
        }
        let row = self.item.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Cursor for a result that outgrew its row cap: replays the rows buffered
/// while draining, then keeps streaming from the live upstream cursor.
pub struct PassthroughRows {
    columns: Vec<Column>,
    buffered: VecDeque<Row>,
    live: Box<dyn Rows>,
    closed: bool,
}

impl PassthroughRows {
    fn new(columns: Vec<Column>, buffered: Vec<Row>, live: Box<dyn Rows>) -> Self {
        Self {
            columns,
            buffered: buffered.into(),
            live,
            closed: false,
        }
    }
}

#[async_trait]
impl Rows for PassthroughRows {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn next(&mut self, cx: &Context) -> Result<Option<Row>> {
        cx.check()?;
        if self.closed {
            return Ok(None);
        }
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }
        cx.try_run(self.live.next(cx)).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffered.clear();
        self.live.close().await
    }
}

pub(crate) enum Drained {
    /// The whole result fit under the cap; the live cursor is closed.
    Complete(Item),
    /// The cap was exceeded; nothing may be stored.
    Overflow(PassthroughRows),
}

/// Materialize `live` while it stays within `max_rows`.
///
/// On any error, cancellation included, the live cursor is closed before the
/// error is returned.
pub(crate) async fn drain(cx: &Context, mut live: Box<dyn Rows>, max_rows: u64) -> Result<Drained> {
    let columns = live.columns().to_vec();
    let mut buffered: Vec<Row> = Vec::new();
    loop {
        let next = cx.try_run(live.next(cx)).await;
        match next {
            Ok(Some(row)) => {
                buffered.push(row);
                if buffered.len() as u64 > max_rows {
                    return Ok(Drained::Overflow(PassthroughRows::new(
                        columns, buffered, live,
                    )));
                }
            }
            Ok(None) => {
                live.close().await?;
                return Ok(Drained::Complete(Item::new(columns, buffered)));
            }
            Err(err) => {
                if let Err(close_err) = live.close().await {
                    debug!(error = %close_err, "closing upstream cursor after failed drain");
                }
                return Err(err);
            }
        }
    }
}
