//! Process-wide pool cache.
//!
//! [`PoolRegistry`] maps a target string to the one pool every
//! [`Connection`](super::Connection) with that target shares. It is an
//! ordinary value owned by the composition root; tests build their own.
//!
//! # Design Decisions
//!
//! - **Exact-string keys**: targets are compared byte for byte; two spellings
//!   of the same endpoint get two pools
//! - **Options fixed at creation**: a cache hit ignores the options passed
//! - **`std::sync::RwLock` for the map**: lookups and inserts never await, and
//!   the pool error observer (a sync callback) must be able to evict
//! - **`Weak` references in the observer**: the observer lives inside the pool,
//!   so strong references back to the entry or the map would form a cycle
//!
//! # Concurrency Safety
//!
//! - The map lock is never held across an await point
//! - Pool creation happens under the write lock and performs no I/O, so two
//!   concurrent `get_or_create` calls for one target build a single pool
//! - Eviction only removes an entry if it is still the cached one for its
//!   target, so a late observer cannot evict a replacement pool

use super::driver::{PoolError, PoolFactory, PoolStatus, SessionPool};
use super::sqlx_pool::SqlxPoolFactory;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, mask_target};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default bound on closing one pool during drain.
pub const DEFAULT_POOL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type PoolMap = RwLock<HashMap<String, Arc<PoolEntry>>>;

/// Why a pool left the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// A fatal pool-level error (administrator termination, TLS teardown).
    Fatal(PoolError),
    /// The connect call that created the pool could not open a session.
    ConnectFailed,
    /// Removed through [`PoolRegistry::evict`].
    Manual,
    /// Closed by [`PoolRegistry::drain_all`].
    Drained,
}

/// Health of a cached pool. `Evicted` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Degraded { last_error: PoolError },
    Evicted { reason: EvictionReason },
}

impl PoolHealth {
    pub fn is_evicted(&self) -> bool {
        matches!(self, Self::Evicted { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cached pool and its health.
pub struct PoolEntry {
    target: String,
    masked_target: String,
    pool: Arc<dyn SessionPool>,
    health: Mutex<PoolHealth>,
}

impl PoolEntry {
    fn new(target: &str, pool: Arc<dyn SessionPool>) -> Self {
        Self {
            target: target.to_string(),
            masked_target: mask_target(target),
            pool,
            health: Mutex::new(PoolHealth::Healthy),
        }
    }

    /// Credential-masked target, safe for logs.
    pub fn masked_target(&self) -> &str {
        &self.masked_target
    }

    pub fn pool(&self) -> &Arc<dyn SessionPool> {
        &self.pool
    }

    pub fn health(&self) -> PoolHealth {
        lock(&self.health).clone()
    }

    /// The most recent pool-level error, if any was observed.
    pub fn last_error(&self) -> Option<PoolError> {
        match &*lock(&self.health) {
            PoolHealth::Healthy => None,
            PoolHealth::Degraded { last_error } => Some(last_error.clone()),
            PoolHealth::Evicted {
                reason: EvictionReason::Fatal(err),
            } => Some(err.clone()),
            PoolHealth::Evicted { .. } => None,
        }
    }

    pub fn is_evicted(&self) -> bool {
        lock(&self.health).is_evicted()
    }

    /// Whether new sessions may still be checked out of this pool.
    pub fn is_usable(&self) -> bool {
        !self.is_evicted() && !self.pool.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Apply a pool-level error. Returns true if this error evicted the pool.
    fn record_error(&self, err: &PoolError) -> bool {
        let mut health = lock(&self.health);
        if health.is_evicted() {
            return false;
        }
        if err.is_fatal() {
            *health = PoolHealth::Evicted {
                reason: EvictionReason::Fatal(err.clone()),
            };
            true
        } else {
            *health = PoolHealth::Degraded {
                last_error: err.clone(),
            };
            false
        }
    }

    /// Mark evicted unless already evicted; the first reason wins.
    fn mark_evicted(&self, reason: EvictionReason) {
        let mut health = lock(&self.health);
        if !health.is_evicted() {
            *health = PoolHealth::Evicted { reason };
        }
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("target", &self.masked_target)
            .field("health", &self.health())
            .field("status", &self.pool.status())
            .finish()
    }
}

/// Result of [`PoolRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub struct CachedPool {
    pub entry: Arc<PoolEntry>,
    /// True when this call built the pool (cache miss).
    pub created: bool,
}

/// Outcome of [`PoolRegistry::drain_all`]. Targets are credential-masked.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub closed: Vec<String>,
    pub failures: Vec<(String, DbError)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Injectable cache of pools keyed by target.
#[derive(Debug)]
pub struct PoolRegistry {
    factory: Arc<dyn PoolFactory>,
    pools: Arc<PoolMap>,
    close_timeout: Duration,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::sqlx()
    }
}

impl PoolRegistry {
    pub fn new(factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            factory,
            pools: Arc::new(RwLock::new(HashMap::new())),
            close_timeout: DEFAULT_POOL_CLOSE_TIMEOUT,
        }
    }

    /// Registry backed by sqlx pools.
    pub fn sqlx() -> Self {
        Self::new(Arc::new(SqlxPoolFactory::new()))
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Return the cached pool for `target`, building it on a miss.
    ///
    /// Options are only used on a miss. A cached entry that was evicted or
    /// whose pool was closed is replaced.
    pub fn get_or_create(&self, target: &str, options: &ConnectionOptions) -> DbResult<CachedPool> {
        {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = pools.get(target).filter(|e| e.is_usable()) {
                return Ok(CachedPool {
                    entry: Arc::clone(entry),
                    created: false,
                });
            }
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check: another caller may have built it between the two locks
        if let Some(entry) = pools.get(target) {
            if entry.is_usable() {
                return Ok(CachedPool {
                    entry: Arc::clone(entry),
                    created: false,
                });
            }
            debug!(target = %entry.masked_target(), "Replacing unusable cached pool");
            entry.mark_evicted(EvictionReason::Manual);
        }

        let pool = self
            .factory
            .create(target, options)
            .map_err(|e| DbError::connection_failed(mask_target(target), e))?;
        let entry = Arc::new(PoolEntry::new(target, pool));
        self.install_observer(&entry);
        pools.insert(target.to_string(), Arc::clone(&entry));

        info!(
            target = %entry.masked_target(),
            max_connections = entry.status().max_connections,
            "Pool created"
        );
        Ok(CachedPool {
            entry,
            created: true,
        })
    }

    fn install_observer(&self, entry: &Arc<PoolEntry>) {
        let weak_pools: Weak<PoolMap> = Arc::downgrade(&self.pools);
        let weak_entry = Arc::downgrade(entry);
        let installed = entry.pool().on_error(Arc::new(move |err: &PoolError| {
            let Some(entry) = weak_entry.upgrade() else {
                return;
            };
            if !entry.record_error(err) {
                warn!(target = %entry.masked_target(), error = %err, "Pool degraded");
                return;
            }
            warn!(target = %entry.masked_target(), error = %err, "Fatal pool error, evicting pool");
            if let Some(pools) = weak_pools.upgrade() {
                remove_if_current(&pools, &entry);
            }
            close_in_background(entry);
        }));
        if !installed {
            debug!(target = %entry.masked_target(), "Pool already has an error observer");
        }
    }

    /// Remove and return the entry for `target`. The pool is not closed.
    pub fn evict(&self, target: &str) -> Option<Arc<PoolEntry>> {
        let entry = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target)?;
        entry.mark_evicted(EvictionReason::Manual);
        info!(target = %entry.masked_target(), "Pool evicted");
        Some(entry)
    }

    /// Evict `entry` (if still cached) and close its pool, bounded by the close timeout.
    pub(crate) async fn retire(&self, entry: &Arc<PoolEntry>, reason: EvictionReason) {
        entry.mark_evicted(reason);
        remove_if_current(&self.pools, entry);
        match tokio::time::timeout(self.close_timeout, entry.pool().close()).await {
            Ok(Ok(())) => debug!(target = %entry.masked_target(), "Retired pool closed"),
            Ok(Err(e)) => warn!(target = %entry.masked_target(), error = %e, "Failed to close retired pool"),
            Err(_) => warn!(target = %entry.masked_target(), "Timed out closing retired pool"),
        }
    }

    pub fn get(&self, target: &str) -> Option<Arc<PoolEntry>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Credential-masked targets of every cached pool.
    pub fn targets(&self) -> Vec<String> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.masked_target().to_string())
            .collect()
    }

    /// Close and remove every cached pool.
    ///
    /// Pools close concurrently, each bounded by the close timeout. A failure
    /// closing one pool does not stop the others; every failure is reported.
    pub async fn drain_all(&self) -> DrainReport {
        // Drain under the lock, close outside it
        let entries: Vec<Arc<PoolEntry>> = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            pools.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return DrainReport::default();
        }

        let close_timeout = self.close_timeout;
        let outcomes = join_all(entries.into_iter().map(|entry| async move {
            entry.mark_evicted(EvictionReason::Drained);
            let start = Instant::now();
            let outcome = match tokio::time::timeout(close_timeout, entry.pool().close()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DbError::internal(format!("Failed to close pool: {e}"))),
                Err(_) => Err(DbError::timeout(
                    "pool close",
                    start.elapsed().as_millis() as u64,
                )),
            };
            (entry.masked_target().to_string(), outcome)
        }))
        .await;

        let mut report = DrainReport::default();
        for (target, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    info!(target = %target, "Pool closed");
                    report.closed.push(target);
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "Failed to close pool");
                    report.failures.push((target, e));
                }
            }
        }
        info!(
            closed = report.closed.len(),
            failed = report.failures.len(),
            "All pools drained"
        );
        report
    }
}

fn remove_if_current(pools: &PoolMap, entry: &Arc<PoolEntry>) {
    let mut pools = pools.write().unwrap_or_else(PoisonError::into_inner);
    if pools
        .get(&entry.target)
        .is_some_and(|cached| Arc::ptr_eq(cached, entry))
    {
        pools.remove(&entry.target);
    }
}

fn close_in_background(entry: Arc<PoolEntry>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = entry.pool().close().await {
                    warn!(target = %entry.masked_target(), error = %e, "Failed to close evicted pool");
                } else {
                    debug!(target = %entry.masked_target(), "Evicted pool closed");
                }
            });
        }
        Err(_) => {
            warn!(target = %entry.masked_target(), "No runtime available, evicted pool closes when dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::PoolErrorKind;

    #[tokio::test]
    async fn test_health_transitions() {
        let pool = SqlxPoolFactory::new()
            .create("sqlite::memory:", &ConnectionOptions::default())
            .unwrap();
        let entry = PoolEntry::new("sqlite::memory:", pool);
        assert_eq!(entry.health(), PoolHealth::Healthy);

        let lost = PoolError::new(PoolErrorKind::ConnectionLost, "eof");
        assert!(!entry.record_error(&lost));
        assert_eq!(
            entry.health(),
            PoolHealth::Degraded {
                last_error: lost.clone()
            }
        );
        assert_eq!(entry.last_error(), Some(lost));

        let admin = PoolError::new(PoolErrorKind::AdminTerminated, "admin");
        assert!(entry.record_error(&admin));
        assert!(entry.is_evicted());
        assert!(!entry.is_usable());

        // Evicted is terminal
        assert!(!entry.record_error(&admin));
        entry.mark_evicted(EvictionReason::Manual);
        assert_eq!(
            entry.health(),
            PoolHealth::Evicted {
                reason: EvictionReason::Fatal(admin)
            }
        );
    }

    #[tokio::test]
    async fn test_sqlx_registry_caches_by_exact_target() {
        let registry = PoolRegistry::sqlx();
        let first = registry
            .get_or_create("sqlite::memory:", &ConnectionOptions::default())
            .unwrap();
        let second = registry
            .get_or_create(
                "sqlite::memory:",
                &ConnectionOptions {
                    max_connections: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
        assert_eq!(second.entry.status().max_connections, 10);
        assert_eq!(registry.len(), 1);

        let report = registry.drain_all().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, vec!["sqlite::memory:".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_factory_error_is_connection_failed() {
        let registry = PoolRegistry::sqlx();
        let err = registry
            .get_or_create("ftp://nowhere", &ConnectionOptions::default())
            .unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed { .. }));
        assert!(registry.is_empty());
    }
}
