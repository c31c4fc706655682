//! Database session layer.
//!
//! This module provides pooled session management:
//! - Driver and pool primitives (`driver`) and their sqlx implementation
//! - The process-wide pool cache (`registry`)
//! - Per-caller connections with self-healing reconnect and transactions
//! - Parameter binding and row decoding for sqlx

pub mod connection;
pub mod driver;
pub mod params;
pub mod registry;
pub mod sqlx_pool;
pub mod types;

pub use connection::{Connection, Transaction};
pub use driver::{
    ErrorObserverSlot, PoolError, PoolErrorKind, PoolErrorObserver, PoolFactory, PoolStatus,
    Session, SessionPool,
};
pub use registry::{
    CachedPool, DEFAULT_POOL_CLOSE_TIMEOUT, DrainReport, EvictionReason, PoolEntry, PoolHealth,
    PoolRegistry,
};
pub use sqlx_pool::{DbPool, SqlxPool, SqlxPoolFactory, SqlxSession};
