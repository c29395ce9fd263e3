//! # sqlcache
//!
//! 透明的 SQL 查询结果缓存层：通过 SQL 注释中的指令决定是否缓存以及缓存多久。
//!
//! Transparent result-set caching for SQL drivers. The interceptor sits where
//! the real driver would, reads cache directives embedded in SQL comments,
//! and answers repeated read queries from a cache instead of re-executing
//! them.
//!
//! ## Overview
//!
//! Aimed at frequent, expensive, idempotent reads (analytics backends,
//! reporting dashboards) where a few seconds of staleness is an acceptable
//! price for not hitting the database again.
//!
//! ```sql
//! -- @cache-ttl 30
//! -- @cache-max-rows 1000
//! SELECT user, timestamp FROM example WHERE value > ?
//! ```
//!
//! ## Key Features
//!
//! - **Drop-in**: [`Interceptor::driver`] returns a driver with the same
//!   open/prepare/query/fetch contract as the one it wraps
//! - **Directive driven**: only queries carrying both directives are cached
//! - **Single-flight**: concurrent identical misses execute upstream once
//! - **Fail-open**: cache backend trouble never breaks a query
//! - **Pluggable storage**: any [`cache::CachePort`] implementation
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`directive`] | Directive parsing and stripping |
//! | [`cache`] | Cache port, backends, keys and per-key locking |
//! | [`drivers`] | Driver contract (connection, statement, rows) |
//! | [`interceptor`] | The caching proxy and its statistics |
//! | [`context`] | Cancellable, deadline-bearing call context |
//! | [`types`] | Values, columns and rows |

pub mod cache;
pub mod context;
pub mod directive;
pub mod drivers;
pub mod interceptor;
pub mod types;

pub use cache::{CachePort, Item, MemoryCache, NullCache, SyncCache};
pub use context::Context;
pub use directive::Attributes;
pub use drivers::{Connection, Driver, Rows, Statement};
pub use interceptor::{Config, Interceptor, Settings, Stats};
pub use types::{Column, ExecResult, Row, Value};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
