//! Per-caller database connection.
//!
//! A [`Connection`] binds one target to one checked-out session from the
//! shared pool and heals itself when that session is lost.
//!
//! # State machine
//!
//! ```text
//!              connect()                 session lost / op in flight
//! Disconnected ─────────► Connected ─────────────────────────► Degraded
//!      ▲                     ▲  │                                  │
//!      │   disconnect()      │  └──────── disconnect() ──────────┐ │
//!      └─────────────────────┼───────────────────────────────────┘ │
//!                            └──── next operation re-acquires ─────┘
//! ```
//!
//! While an operation runs, its session is moved out of the state and the
//! connection is `Degraded`. A finished operation parks a healthy session
//! back; a cancelled one drops it, which discards it, and the next operation
//! re-acquires.

use super::driver::Session;
use super::registry::{EvictionReason, PoolEntry, PoolRegistry};
use crate::error::{DbError, DbResult, DriverError, DriverErrorKind};
use crate::models::{ConnectionOptions, ConnectionStatus, QueryOptions, QueryParam, Row, mask_target};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Round trip used to confirm a freshly checked-out session works.
const LIVENESS_PROBE: &str = "SELECT 1";

const BEGIN: &str = "BEGIN";
const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// Everything a connection knows about its target, minus the session.
#[derive(Debug, Clone)]
struct Binding {
    target: String,
    masked_target: String,
    options: ConnectionOptions,
    entry: Arc<PoolEntry>,
}

enum State {
    Disconnected,
    Connected {
        binding: Binding,
        session: Box<dyn Session>,
    },
    Degraded {
        binding: Binding,
    },
}

impl State {
    fn binding(&self) -> Option<&Binding> {
        match self {
            State::Disconnected => None,
            State::Connected { binding, .. } | State::Degraded { binding } => Some(binding),
        }
    }
}

/// How a bounded statement failed.
enum ExecFailure {
    Driver(DriverError),
    TimedOut(Duration),
}

impl ExecFailure {
    /// True when the session that ran the statement must not be reused.
    fn poisons_session(&self) -> bool {
        match self {
            ExecFailure::Driver(e) => e.is_connection_terminated(),
            ExecFailure::TimedOut(_) => true,
        }
    }

    fn into_db_error(self, operation: &str, masked_target: &str) -> DbError {
        match self {
            ExecFailure::Driver(e) => DbError::query_failed(masked_target, e),
            ExecFailure::TimedOut(elapsed) => {
                DbError::timeout(operation, elapsed.as_millis() as u64)
            }
        }
    }
}

/// Execute one statement, bounded by `timeout` when given.
async fn run_bounded(
    session: &mut dyn Session,
    sql: &str,
    params: &[QueryParam],
    timeout: Option<Duration>,
) -> Result<Vec<Row>, ExecFailure> {
    let start = Instant::now();
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, session.execute(sql, params)).await {
            Ok(result) => result.map_err(ExecFailure::Driver),
            Err(_) => Err(ExecFailure::TimedOut(start.elapsed())),
        },
        None => session.execute(sql, params).await.map_err(ExecFailure::Driver),
    }
}

/// Release a session unless `poisoned`, in which case discard it.
fn dispose(session: Box<dyn Session>, poisoned: bool) {
    if poisoned || !session.is_alive() {
        session.discard();
    } else {
        session.release();
    }
}

fn decode_value<T: DeserializeOwned>(row: Option<Row>, masked_target: &str) -> DbResult<Option<T>> {
    let Some(value) = row.and_then(Row::into_first_value) else {
        return Ok(None);
    };
    serde_json::from_value(value).map(Some).map_err(|e| {
        DbError::query_failed(
            masked_target,
            DriverError::new(
                DriverErrorKind::Decode,
                format!("Failed to decode query value: {e}"),
            ),
        )
    })
}

/// A logical connection to one target.
///
/// Methods take `&mut self`: one connection runs one operation at a time.
/// Share the [`PoolRegistry`], not the connection, for concurrency.
pub struct Connection {
    id: String,
    registry: Arc<PoolRegistry>,
    state: State,
    last_error: Option<DbError>,
}

impl Connection {
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            registry,
            state: State::Disconnected,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.state {
            State::Disconnected => ConnectionStatus::Disconnected,
            State::Connected { .. } => ConnectionStatus::Connected,
            State::Degraded { .. } => ConnectionStatus::Degraded,
        }
    }

    /// Credential-masked target, if one is bound.
    pub fn target(&self) -> Option<&str> {
        self.state.binding().map(|b| b.masked_target.as_str())
    }

    /// The pool entry currently bound, if any.
    pub fn pool_entry(&self) -> Option<&Arc<PoolEntry>> {
        self.state.binding().map(|b| &b.entry)
    }

    /// The most recent error any operation on this connection returned.
    pub fn last_error(&self) -> Option<&DbError> {
        self.last_error.as_ref()
    }

    fn record(&mut self, err: DbError) -> DbError {
        self.last_error = Some(err.clone());
        err
    }

    /// Connect to `target`, checking out and probing a session.
    ///
    /// Connecting again to the same target with a live session is a no-op.
    /// Connecting to a different target disconnects first.
    pub async fn connect(&mut self, target: &str, options: ConnectionOptions) -> DbResult<()> {
        if target.trim().is_empty() {
            return Err(self.record(DbError::invalid_argument(
                "Connection target must not be empty",
            )));
        }
        if let Err(e) = options.validate() {
            return Err(self.record(e));
        }

        if let State::Connected { binding, session } = &self.state {
            if binding.target == target && session.is_alive() && binding.entry.is_usable() {
                debug!(connection_id = %self.id, target = %binding.masked_target, "Already connected");
                return Ok(());
            }
        }
        self.disconnect();

        let masked_target = mask_target(target);
        let cached = match self.registry.get_or_create(target, &options) {
            Ok(cached) => cached,
            Err(e) => return Err(self.record(e)),
        };
        let binding = Binding {
            target: target.to_string(),
            masked_target,
            options,
            entry: Arc::clone(&cached.entry),
        };

        match open_session(&binding).await {
            Ok(session) => {
                info!(
                    connection_id = %self.id,
                    target = %binding.masked_target,
                    pool_created = cached.created,
                    "Connected"
                );
                self.state = State::Connected { binding, session };
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    target = %binding.masked_target,
                    error = %e,
                    "Connect failed"
                );
                if cached.created {
                    self.registry
                        .retire(&cached.entry, EvictionReason::ConnectFailed)
                        .await;
                }
                Err(self.record(e))
            }
        }
    }

    /// Release the held session and forget the target. Never closes the pool.
    pub fn disconnect(&mut self) {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Connected { binding, session } => {
                dispose(session, false);
                info!(connection_id = %self.id, target = %binding.masked_target, "Disconnected");
            }
            State::Degraded { binding } => {
                info!(connection_id = %self.id, target = %binding.masked_target, "Disconnected");
            }
            State::Disconnected => {}
        }
    }

    /// Take the session out of the state for one operation, re-acquiring if needed.
    ///
    /// On return the state is `Degraded`; [`Self::park`] restores it.
    async fn take_session(&mut self, operation: &str) -> DbResult<(Binding, Box<dyn Session>)> {
        let binding = match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Disconnected => return Err(DbError::not_connected(operation)),
            State::Connected { binding, session }
                if session.is_alive() && !binding.entry.is_evicted() =>
            {
                self.state = State::Degraded {
                    binding: binding.clone(),
                };
                return Ok((binding, session));
            }
            State::Connected { binding, session } => {
                debug!(connection_id = %self.id, "Dropping session from a dead or evicted pool");
                session.discard();
                binding
            }
            State::Degraded { binding } => binding,
        };
        self.state = State::Degraded {
            binding: binding.clone(),
        };
        self.reacquire(binding).await
    }

    async fn reacquire(&mut self, mut binding: Binding) -> DbResult<(Binding, Box<dyn Session>)> {
        let mut created = false;
        if !binding.entry.is_usable() {
            let cached = self.registry.get_or_create(&binding.target, &binding.options)?;
            created = cached.created;
            binding.entry = cached.entry;
            self.state = State::Degraded {
                binding: binding.clone(),
            };
        }
        match open_session(&binding).await {
            Ok(session) => {
                info!(connection_id = %self.id, target = %binding.masked_target, "Re-acquired session");
                Ok((binding, session))
            }
            Err(e) => {
                // A pool that never produced a session is not left for other callers
                if created {
                    self.registry
                        .retire(&binding.entry, EvictionReason::ConnectFailed)
                        .await;
                }
                Err(e)
            }
        }
    }

    fn park(&mut self, binding: Binding, session: Box<dyn Session>) {
        self.state = State::Connected { binding, session };
    }

    /// Run a parameterized query and return its rows in database order.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.query_with_options(sql, params, &QueryOptions::default())
            .await
    }

    /// Like [`Self::query`], with a per-call timeout overriding `query_timeout_ms`.
    pub async fn query_with_options(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        options: &QueryOptions,
    ) -> DbResult<Vec<Row>> {
        let (binding, mut session) = match self.take_session("query").await {
            Ok(taken) => taken,
            Err(e) => return Err(self.record(e)),
        };
        let timeout = options.timeout.or(binding.options.query_timeout());
        let start = Instant::now();

        match run_bounded(session.as_mut(), sql, params, timeout).await {
            Ok(rows) => {
                debug!(
                    connection_id = %self.id,
                    rows = rows.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query executed"
                );
                self.park(binding, session);
                Ok(rows)
            }
            Err(failure) => {
                let masked = binding.masked_target.clone();
                if failure.poisons_session() {
                    warn!(
                        connection_id = %self.id,
                        target = %masked,
                        "Session lost during query, discarding"
                    );
                    session.discard();
                } else {
                    self.park(binding, session);
                }
                Err(self.record(failure.into_db_error("query", &masked)))
            }
        }
    }

    /// First row of the result, if any.
    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// First column of the first row decoded as `T`, if any row came back.
    ///
    /// Use `Option<T>` for columns that may be NULL.
    pub async fn query_value<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<T>> {
        let row = self.query_one(sql, params).await?;
        let masked = self.target().unwrap_or_default().to_string();
        decode_value(row, &masked).map_err(|e| self.record(e))
    }

    /// Run `body` inside BEGIN/COMMIT on this connection's session.
    ///
    /// If the body or the commit fails, exactly one ROLLBACK is issued and the
    /// original error is returned inside `TransactionFailed`; a rollback error
    /// is attached, never substituted. When the session is already gone the
    /// server aborts the transaction itself and no ROLLBACK is sent.
    ///
    /// ```ignore
    /// let id: i64 = conn
    ///     .transaction(|tx| Box::pin(async move {
    ///         tx.query("INSERT INTO t (v) VALUES ($1)", &[1.into()]).await?;
    ///         Ok(tx.query_value("SELECT max(id) FROM t", &[]).await?.unwrap_or(0))
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&mut self, body: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, DbResult<T>> + Send,
        T: Send,
    {
        let (binding, mut session) = match self.take_session("transaction").await {
            Ok(taken) => taken,
            Err(e) => return Err(self.record(e)),
        };
        let masked = binding.masked_target.clone();
        let timeout = binding.options.query_timeout();

        if let Err(failure) = run_bounded(session.as_mut(), BEGIN, &[], timeout).await {
            dispose(session, failure.poisons_session());
            let err = failure.into_db_error("begin", &masked);
            return Err(self.record(DbError::transaction_failed(masked, err, None)));
        }
        debug!(connection_id = %self.id, "Transaction started");

        let (result, broken) = {
            let mut tx = Transaction {
                session: session.as_mut(),
                masked_target: &masked,
                query_timeout: timeout,
                broken: false,
            };
            let result = body(&mut tx).await;
            (result, tx.broken)
        };

        let original = match result {
            Ok(value) => match run_bounded(session.as_mut(), COMMIT, &[], timeout).await {
                Ok(_) => {
                    debug!(connection_id = %self.id, "Transaction committed");
                    self.park(binding, session);
                    return Ok(value);
                }
                Err(failure) if failure.poisons_session() => {
                    session.discard();
                    let err = failure.into_db_error("commit", &masked);
                    return Err(self.record(DbError::transaction_failed(masked, err, None)));
                }
                Err(failure) => failure.into_db_error("commit", &masked),
            },
            Err(e) if broken || e.is_connection_terminated() || !session.is_alive() => {
                warn!(connection_id = %self.id, error = %e, "Session lost inside transaction, discarding");
                session.discard();
                return Err(self.record(DbError::transaction_failed(masked, e, None)));
            }
            Err(e) => e,
        };

        let rollback = match run_bounded(session.as_mut(), ROLLBACK, &[], timeout).await {
            Ok(_) => {
                debug!(connection_id = %self.id, error = %original, "Transaction rolled back");
                self.park(binding, session);
                None
            }
            Err(failure) => {
                // Transaction state on the session is unknown now
                session.discard();
                let err = failure.into_db_error("rollback", &masked);
                warn!(connection_id = %self.id, error = %err, "Rollback failed");
                Some(err)
            }
        };
        Err(self.record(DbError::transaction_failed(masked, original, rollback)))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("target", &self.target())
            .finish()
    }
}

/// Check out a session for `binding` and make it ready for use.
async fn open_session(binding: &Binding) -> DbResult<Box<dyn Session>> {
    let connect_timeout = binding.options.connect_timeout_or_default();
    let mut session = binding
        .entry
        .pool()
        .checkout(connect_timeout)
        .await
        .map_err(|e| match e {
            DbError::Timeout { elapsed_ms, .. } => DbError::connection_failed(
                binding.masked_target.clone(),
                DriverError::new(
                    DriverErrorKind::PoolTimedOut,
                    format!("No session available after {elapsed_ms}ms"),
                ),
            ),
            other => other,
        })?;

    let prepared = tokio::time::timeout(connect_timeout, async {
        if let Some(statement_timeout) = binding.options.statement_timeout() {
            session.set_statement_timeout(statement_timeout).await?;
        }
        session.execute(LIVENESS_PROBE, &[]).await.map(|_| ())
    })
    .await;

    match prepared {
        Ok(Ok(())) => Ok(session),
        Ok(Err(e)) => {
            dispose(session, e.is_connection_terminated());
            Err(DbError::connection_failed(binding.masked_target.clone(), e))
        }
        Err(_) => {
            session.discard();
            Err(DbError::connection_failed(
                binding.masked_target.clone(),
                DriverError::new(
                    DriverErrorKind::PoolTimedOut,
                    format!(
                        "Session probe exceeded {}ms",
                        connect_timeout.as_millis()
                    ),
                ),
            ))
        }
    }
}

/// The session handed to a [`Connection::transaction`] body.
///
/// Offers queries only; a transaction cannot be nested.
pub struct Transaction<'a> {
    session: &'a mut dyn Session,
    masked_target: &'a str,
    query_timeout: Option<Duration>,
    broken: bool,
}

impl Transaction<'_> {
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.query_with_options(sql, params, &QueryOptions::default())
            .await
    }

    pub async fn query_with_options(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        options: &QueryOptions,
    ) -> DbResult<Vec<Row>> {
        let timeout = options.timeout.or(self.query_timeout);
        match run_bounded(&mut *self.session, sql, params, timeout).await {
            Ok(rows) => Ok(rows),
            Err(failure) => {
                if failure.poisons_session() {
                    self.broken = true;
                }
                Err(failure.into_db_error("query", self.masked_target))
            }
        }
    }

    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    pub async fn query_value<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<T>> {
        let row = self.query_one(sql, params).await?;
        decode_value(row, self.masked_target)
    }

    /// True once a statement in this transaction lost the session.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("target", &self.masked_target)
            .field("broken", &self.broken)
            .finish()
    }
}
