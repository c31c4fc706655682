//! Scriptable in-memory driver for integration tests.
//!
//! `MockDriver` is a `PoolFactory` whose pools and sessions count every
//! interaction and record every statement, so tests can assert on exactly
//! what a `Connection` did without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use db_session_manager::db::{
    ErrorObserverSlot, PoolErrorObserver, PoolFactory, PoolRegistry, PoolStatus, Session,
    SessionPool,
};
use db_session_manager::error::{DbError, DbResult, DriverError, DriverErrorKind};
use db_session_manager::models::{ConnectionOptions, QueryParam, Row};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counters and scripts shared by a driver and everything it creates.
#[derive(Debug, Default)]
pub struct MockState {
    pub creates: AtomicUsize,
    pub checkouts: AtomicUsize,
    pub releases: AtomicUsize,
    pub discards: AtomicUsize,
    pub closes: AtomicUsize,
    executed: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, DriverError)>>,
    responses: Mutex<Vec<(String, Vec<Row>)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    failing_close: Mutex<HashSet<String>>,
    refuse_checkout: AtomicBool,
    pools: Mutex<HashMap<String, Vec<Arc<MockPool>>>>,
}

impl MockState {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every statement executed, in order, across all sessions.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// How many executed statements equal `sql` exactly.
    pub fn count(&self, sql: &str) -> usize {
        self.executed().iter().filter(|s| s.as_str() == sql).count()
    }

    pub fn clear_executed(&self) {
        self.executed.lock().unwrap().clear();
    }

    /// Fail the next statement containing `pattern`, once.
    pub fn fail_next(&self, pattern: &str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), error));
    }

    /// Answer every statement containing `pattern` with `rows`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), rows));
    }

    /// Delay every statement containing `pattern`.
    pub fn delay(&self, pattern: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .push((pattern.to_string(), delay));
    }

    /// Make `close()` fail for pools of `target`.
    pub fn fail_close(&self, target: &str) {
        self.failing_close.lock().unwrap().insert(target.to_string());
    }

    pub fn refuse_checkouts(&self, refuse: bool) {
        self.refuse_checkout.store(refuse, Ordering::SeqCst);
    }

    /// Latest pool created for `target`.
    pub fn pool(&self, target: &str) -> Option<Arc<MockPool>> {
        self.pools
            .lock()
            .unwrap()
            .get(target)
            .and_then(|pools| pools.last().cloned())
    }

    fn take_failure(&self, sql: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock().unwrap();
        let idx = failures.iter().position(|(p, _)| sql.contains(p.as_str()))?;
        Some(failures.remove(idx).1)
    }

    fn response(&self, sql: &str) -> Vec<Row> {
        if let Some((_, rows)) = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
        {
            return rows.clone();
        }
        if sql == "SELECT 1" {
            return vec![Row::from_pairs([("?column?", json!(1))])];
        }
        Vec::new()
    }

    fn delay_for(&self, sql: &str) -> Option<Duration> {
        self.delays
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, d)| *d)
    }
}

/// Host that makes the mock accept a target of any scheme.
pub const MOCK_HOST: &str = "mock.invalid";

/// `PoolFactory` producing [`MockPool`]s.
///
/// Accepts `mock://` targets and any target naming [`MOCK_HOST`].
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry over this driver.
    pub fn registry(&self) -> Arc<PoolRegistry> {
        Arc::new(PoolRegistry::new(Arc::new(self.clone())).with_close_timeout(Duration::from_secs(1)))
    }
}

impl PoolFactory for MockDriver {
    fn create(
        &self,
        target: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SessionPool>, DriverError> {
        if !target.starts_with("mock://") && !target.contains(MOCK_HOST) {
            return Err(DriverError::new(
                DriverErrorKind::Configuration,
                format!("mock driver cannot open {target}"),
            ));
        }
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::new(MockPool {
            target: target.to_string(),
            max_connections: options.max_connections_or_default(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
            observers: Arc::new(ErrorObserverSlot::new()),
        });
        self.state
            .pools
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push(Arc::clone(&pool));
        Ok(pool)
    }
}

#[derive(Debug)]
pub struct MockPool {
    pub target: String,
    max_connections: u32,
    state: Arc<MockState>,
    closed: AtomicBool,
    observers: Arc<ErrorObserverSlot>,
}

impl MockPool {
    /// Raise a pool-level error as the driver would from a background session.
    pub fn emit(&self, error: DriverError) {
        self.observers.report(&error);
    }

    pub fn has_observer(&self) -> bool {
        self.observers.is_installed()
    }
}

#[async_trait]
impl SessionPool for MockPool {
    async fn checkout(&self, _timeout: Duration) -> DbResult<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_failed(
                self.target.clone(),
                DriverError::new(DriverErrorKind::PoolClosed, "Connection pool is closed"),
            ));
        }
        if self.state.refuse_checkout.load(Ordering::SeqCst) {
            return Err(DbError::connection_failed(
                self.target.clone(),
                DriverError::new(DriverErrorKind::ConnectionClosed, "connection refused"),
            ));
        }
        self.state.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            observers: Arc::clone(&self.observers),
            alive: true,
            finished: false,
        }))
    }

    fn on_error(&self, observer: PoolErrorObserver) -> bool {
        self.observers.install(observer)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.failing_close.lock().unwrap().contains(&self.target) {
            return Err(DriverError::new(DriverErrorKind::Other, "close failed"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: self.max_connections,
            size: 0,
            idle: 0,
        }
    }
}

#[derive(Debug)]
pub struct MockSession {
    state: Arc<MockState>,
    observers: Arc<ErrorObserverSlot>,
    alive: bool,
    finished: bool,
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> Result<Vec<Row>, DriverError> {
        self.state.executed.lock().unwrap().push(sql.to_string());
        if let Some(delay) = self.state.delay_for(sql) {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.take_failure(sql) {
            if err.is_connection_terminated() {
                self.alive = false;
            }
            self.observers.report(&err);
            return Err(err);
        }
        Ok(self.state.response(sql))
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.execute(
            &format!("SET statement_timeout = {}", timeout.as_millis()),
            &[],
        )
        .await
        .map(|_| ())
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn release(mut self: Box<Self>) {
        self.finished = true;
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn discard(mut self: Box<Self>) {
        self.finished = true;
        self.state.discards.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if !self.finished {
            self.state.discards.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Error a dead transport reports.
pub fn terminated() -> DriverError {
    DriverError::from_message(
        "Connection terminated unexpectedly",
        DriverErrorKind::Other,
    )
}

/// Error an administrator-killed backend reports.
pub fn admin_terminated() -> DriverError {
    DriverError::database(
        "terminating connection due to administrator command",
        Some("57P01".to_string()),
    )
}

/// Ordinary statement error that leaves the session usable.
pub fn syntax_error() -> DriverError {
    DriverError::database("syntax error at or near \"SELEC\"", Some("42601".to_string()))
}
