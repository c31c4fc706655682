//! Driver and pool primitives the session manager is built on.
//!
//! [`PoolFactory`] opens a [`SessionPool`] per target; a pool hands out
//! [`Session`]s. The production implementation lives in
//! [`sqlx_pool`](super::sqlx_pool); tests plug in their own.
//!
//! # Session ownership
//!
//! A checked-out session is owned by exactly one caller and must leave that
//! caller through [`Session::release`] (healthy, back to the pool) or
//! [`Session::discard`] (state unknown, capacity freed, never reused).
//! Dropping a session without either is treated as a discard, so aborted
//! futures cannot leak a session or hand a poisoned one to another borrower.

use crate::error::{DbResult, DriverError, DriverErrorKind};
use crate::models::{ConnectionOptions, QueryParam, Row};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One leased connection to the database.
#[async_trait]
pub trait Session: Send + fmt::Debug {
    /// Execute `sql` with `params` bound out-of-band and collect every row.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, DriverError>;

    /// Apply a session-scoped server-side statement timeout.
    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Local knowledge only: false once the session has seen its transport die.
    fn is_alive(&self) -> bool;

    /// Return the session to its pool for reuse.
    fn release(self: Box<Self>);

    /// Drop the session without returning it; its pool slot is freed.
    fn discard(self: Box<Self>);
}

/// A bounded set of reusable sessions for exactly one target.
#[async_trait]
pub trait SessionPool: Send + Sync + fmt::Debug {
    /// Lease a session, waiting at most `timeout` for capacity or a new connection.
    ///
    /// Fails with [`DbError::Timeout`](crate::error::DbError::Timeout) when the
    /// bound elapses, otherwise with `ConnectionFailed`.
    async fn checkout(&self, timeout: Duration) -> DbResult<Box<dyn Session>>;

    /// Install the pool-level error observer. Only the first call takes effect;
    /// returns whether this call installed it.
    fn on_error(&self, observer: PoolErrorObserver) -> bool;

    /// Close the pool, waiting for leased sessions to come back.
    async fn close(&self) -> Result<(), DriverError>;

    fn is_closed(&self) -> bool;

    fn status(&self) -> PoolStatus;
}

/// Builds pools for targets. Must not perform network I/O.
pub trait PoolFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        target: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SessionPool>, DriverError>;
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    /// Open sessions, idle or leased.
    pub size: u32,
    pub idle: u32,
}

/// Classification of a pool-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolErrorKind {
    AdminTerminated,
    TlsClosed,
    ConnectionLost,
}

impl PoolErrorKind {
    /// Fatal errors make the whole pool unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AdminTerminated | Self::TlsClosed)
    }
}

/// An error that concerns a pool rather than a single statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

impl PoolError {
    pub fn new(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map a driver error to a pool error; statement-level errors yield None.
    pub fn classify(err: &DriverError) -> Option<Self> {
        let kind = match err.kind {
            DriverErrorKind::AdminTerminated => PoolErrorKind::AdminTerminated,
            DriverErrorKind::TlsClosed => PoolErrorKind::TlsClosed,
            DriverErrorKind::ConnectionClosed => PoolErrorKind::ConnectionLost,
            _ => return None,
        };
        Some(Self::new(kind, err.message.clone()))
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

pub type PoolErrorObserver = Arc<dyn Fn(&PoolError) + Send + Sync>;

/// Write-once observer slot shared by a pool and the sessions it leases.
#[derive(Default)]
pub struct ErrorObserverSlot {
    observer: OnceLock<PoolErrorObserver>,
}

impl ErrorObserverSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the observer; later calls are ignored.
    pub fn install(&self, observer: PoolErrorObserver) -> bool {
        self.observer.set(observer).is_ok()
    }

    pub fn is_installed(&self) -> bool {
        self.observer.get().is_some()
    }

    /// Forward a driver error to the observer if it is pool-level.
    pub fn report(&self, err: &DriverError) {
        if let (Some(observer), Some(pool_err)) = (self.observer.get(), PoolError::classify(err))
        {
            observer(&pool_err);
        }
    }
}

impl fmt::Debug for ErrorObserverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorObserverSlot")
            .field("installed", &self.is_installed())
            .finish()
    }
}
