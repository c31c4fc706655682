//! Pool cache behavior against the scriptable mock driver.

mod common;

use common::{MockDriver, admin_terminated};
use db_session_manager::db::{EvictionReason, PoolHealth};
use db_session_manager::error::DbError;
use db_session_manager::models::ConnectionOptions;
use std::sync::Arc;

const A: &str = "mock://app:pw@a.internal/db";
const B: &str = "mock://app:pw@b.internal/db";
const C: &str = "mock://app:pw@c.internal/db";

#[tokio::test]
async fn test_same_target_returns_same_pool() {
    let driver = MockDriver::new();
    let registry = driver.registry();

    let first = registry
        .get_or_create(A, &ConnectionOptions::default())
        .unwrap();
    let second = registry
        .get_or_create(
            A,
            &ConnectionOptions {
                max_connections: Some(2),
                statement_timeout_ms: Some(100),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert!(Arc::ptr_eq(&first.entry, &second.entry));
    // Options of a cache hit are ignored
    assert_eq!(second.entry.status().max_connections, 10);
    assert_eq!(driver.state.creates(), 1);
}

#[tokio::test]
async fn test_distinct_spellings_get_distinct_pools() {
    let driver = MockDriver::new();
    let registry = driver.registry();

    let plain = registry
        .get_or_create("mock://a.internal/db", &ConnectionOptions::default())
        .unwrap();
    let slash = registry
        .get_or_create("mock://a.internal/db/", &ConnectionOptions::default())
        .unwrap();

    assert!(!Arc::ptr_eq(&plain.entry, &slash.entry));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_concurrent_get_or_create_builds_one_pool() {
    let driver = MockDriver::new();
    let registry = driver.registry();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create(A, &ConnectionOptions::default())
                    .map(|cached| cached.entry)
            })
        })
        .collect();

    let mut entries = Vec::new();
    for handle in handles {
        entries.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(driver.state.creates(), 1);
    assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
}

#[tokio::test]
async fn test_factory_rejection_caches_nothing() {
    let driver = MockDriver::new();
    let registry = driver.registry();

    let err = registry
        .get_or_create("postgres://nowhere/db", &ConnectionOptions::default())
        .unwrap_err();

    assert!(matches!(err, DbError::ConnectionFailed { .. }));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_evict_removes_without_closing() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    registry.get_or_create(A, &ConnectionOptions::default()).unwrap();

    let evicted = registry.evict(A).unwrap();

    assert!(!registry.contains(A));
    assert_eq!(
        evicted.health(),
        PoolHealth::Evicted {
            reason: EvictionReason::Manual
        }
    );
    assert!(!evicted.pool().is_closed());
    assert_eq!(driver.state.closes(), 0);
    assert!(registry.evict(A).is_none());

    // The next lookup builds a new pool
    let fresh = registry.get_or_create(A, &ConnectionOptions::default()).unwrap();
    assert!(fresh.created);
    assert_eq!(driver.state.creates(), 2);
}

#[tokio::test]
async fn test_closed_pool_is_replaced() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    let first = registry.get_or_create(A, &ConnectionOptions::default()).unwrap();
    tokio_test::assert_ok!(first.entry.pool().close().await);

    let second = registry.get_or_create(A, &ConnectionOptions::default()).unwrap();

    assert!(second.created);
    assert!(!Arc::ptr_eq(&first.entry, &second.entry));
    assert!(first.entry.is_evicted());
}

#[tokio::test]
async fn test_late_fatal_error_does_not_evict_replacement() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    registry.get_or_create(A, &ConnectionOptions::default()).unwrap();
    let old_pool = driver.state.pool(A).unwrap();
    registry.evict(A).unwrap();
    let replacement = registry.get_or_create(A, &ConnectionOptions::default()).unwrap();

    old_pool.emit(admin_terminated());

    let cached = registry.get(A).unwrap();
    assert!(Arc::ptr_eq(&cached, &replacement.entry));
    assert_eq!(cached.health(), PoolHealth::Healthy);
}

#[tokio::test]
async fn test_targets_are_masked() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    registry.get_or_create(A, &ConnectionOptions::default()).unwrap();

    let targets = registry.targets();
    assert_eq!(targets.len(), 1);
    assert!(!targets[0].contains(":pw@"));
}

#[tokio::test]
async fn test_drain_all_reports_failures_and_empties_cache() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    for target in [A, B, C] {
        registry
            .get_or_create(target, &ConnectionOptions::default())
            .unwrap();
    }
    driver.state.fail_close(B);

    let report = registry.drain_all().await;

    assert_eq!(report.closed.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(!report.is_clean());
    let (failed_target, err) = &report.failures[0];
    assert!(failed_target.contains("b.internal"));
    assert!(matches!(err, DbError::Internal { .. }));
    // Every pool was asked to close, including the failing one
    assert_eq!(driver.state.closes(), 3);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_drain_all_on_empty_registry() {
    let driver = MockDriver::new();
    let registry = driver.registry();

    let report = registry.drain_all().await;

    assert!(report.is_clean());
    assert!(report.closed.is_empty());
    assert_eq!(driver.state.closes(), 0);
}

#[tokio::test]
async fn test_drained_entries_are_marked() {
    let driver = MockDriver::new();
    let registry = driver.registry();
    let cached = registry.get_or_create(A, &ConnectionOptions::default()).unwrap();

    registry.drain_all().await;

    assert_eq!(
        cached.entry.health(),
        PoolHealth::Evicted {
            reason: EvictionReason::Drained
        }
    );
}
