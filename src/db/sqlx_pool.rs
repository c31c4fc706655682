//! sqlx-backed implementation of the driver primitives.
//!
//! Pools are created lazily (`connect_lazy_with`), so building one never
//! touches the network; the first checkout opens the first session.

use super::driver::{
    ErrorObserverSlot, PoolErrorObserver, PoolFactory, PoolStatus, Session, SessionPool,
};
use super::params::bind_params;
use super::types::IntoResultRow;
use crate::error::{DbError, DbResult, DriverError, DriverErrorKind};
use crate::models::{ConnectionOptions, DatabaseType, QueryParam, Row, TlsMode, mask_target};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySql, MySqlConnection, MySqlPool, PgConnection, PgPool, Postgres, Sqlite};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Database pool wrapper supporting multiple database types.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

/// A leased sqlx connection.
#[derive(Debug)]
enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    /// Take the connection out of the pool's accounting and close it on drop.
    fn detach(self) {
        match self {
            DbConnection::MySql(c) => drop(c.detach()),
            DbConnection::Postgres(c) => drop(c.detach()),
            DbConnection::SQLite(c) => drop(c.detach()),
        }
    }
}

/// Creates sqlx pools for postgres, mysql and sqlite targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxPoolFactory;

impl SqlxPoolFactory {
    pub fn new() -> Self {
        Self
    }
}

impl PoolFactory for SqlxPoolFactory {
    fn create(
        &self,
        target: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn SessionPool>, DriverError> {
        let db_type = DatabaseType::from_connection_string(target).ok_or_else(|| {
            DriverError::new(
                DriverErrorKind::Configuration,
                "Unknown database type. Connection string must start with postgres://, postgresql://, mysql://, mariadb://, or sqlite:",
            )
        })?;

        let max_connections = options.max_connections_or_default();
        let acquire_timeout = options.connect_timeout_or_default();
        let idle_timeout = Some(options.idle_timeout_or_default());

        let pool = match db_type {
            DatabaseType::MySQL => {
                let mut connect = MySqlConnectOptions::from_str(target)?.charset("utf8mb4");
                if let Some(tls) = options.tls {
                    connect = connect.ssl_mode(mysql_ssl_mode(tls));
                }
                DbPool::MySql(
                    MySqlPoolOptions::new()
                        .min_connections(0)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(true)
                        .connect_lazy_with(connect),
                )
            }
            DatabaseType::PostgreSQL => {
                let mut connect = PgConnectOptions::from_str(target)?;
                if let Some(tls) = options.tls {
                    connect = connect.ssl_mode(pg_ssl_mode(tls));
                }
                DbPool::Postgres(
                    PgPoolOptions::new()
                        .min_connections(0)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(true)
                        .connect_lazy_with(connect),
                )
            }
            DatabaseType::SQLite => {
                if options.tls.is_some() {
                    debug!("TLS settings do not apply to SQLite targets, ignoring");
                }
                let connect = SqliteConnectOptions::from_str(target)?.create_if_missing(true);
                DbPool::SQLite(
                    SqlitePoolOptions::new()
                        .min_connections(0)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(true)
                        .connect_lazy_with(connect),
                )
            }
        };

        debug!(
            target = %mask_target(target),
            db_type = %db_type,
            max_connections,
            "Created lazy pool"
        );

        Ok(Arc::new(SqlxPool {
            target: mask_target(target),
            pool,
            max_connections,
            observers: Arc::new(ErrorObserverSlot::new()),
        }))
    }
}

fn pg_ssl_mode(tls: TlsMode) -> PgSslMode {
    match tls {
        TlsMode::Disabled => PgSslMode::Disable,
        TlsMode::Enabled => PgSslMode::VerifyFull,
        TlsMode::EnabledNoVerify => PgSslMode::Require,
    }
}

fn mysql_ssl_mode(tls: TlsMode) -> MySqlSslMode {
    match tls {
        TlsMode::Disabled => MySqlSslMode::Disabled,
        TlsMode::Enabled => MySqlSslMode::VerifyIdentity,
        TlsMode::EnabledNoVerify => MySqlSslMode::Required,
    }
}

/// A sqlx pool for one target.
#[derive(Debug)]
pub struct SqlxPool {
    /// Credential-masked, for errors.
    target: String,
    pool: DbPool,
    max_connections: u32,
    observers: Arc<ErrorObserverSlot>,
}

#[async_trait]
impl SessionPool for SqlxPool {
    async fn checkout(&self, timeout: Duration) -> DbResult<Box<dyn Session>> {
        let start = Instant::now();
        let acquired = match &self.pool {
            DbPool::MySql(p) => tokio::time::timeout(timeout, p.acquire())
                .await
                .map(|r| r.map(DbConnection::MySql)),
            DbPool::Postgres(p) => tokio::time::timeout(timeout, p.acquire())
                .await
                .map(|r| r.map(DbConnection::Postgres)),
            DbPool::SQLite(p) => tokio::time::timeout(timeout, p.acquire())
                .await
                .map(|r| r.map(DbConnection::SQLite)),
        };

        match acquired {
            Ok(Ok(conn)) => Ok(Box::new(SqlxSession {
                conn: Some(conn),
                alive: true,
                observers: Arc::clone(&self.observers),
            })),
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => Err(DbError::timeout(
                "session checkout",
                start.elapsed().as_millis() as u64,
            )),
            Ok(Err(e)) => {
                let err = DriverError::from(e);
                self.observers.report(&err);
                Err(DbError::connection_failed(self.target.clone(), err))
            }
        }
    }

    fn on_error(&self, observer: PoolErrorObserver) -> bool {
        self.observers.install(observer)
    }

    async fn close(&self) -> Result<(), DriverError> {
        match &self.pool {
            DbPool::MySql(p) => p.close().await,
            DbPool::Postgres(p) => p.close().await,
            DbPool::SQLite(p) => p.close().await,
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        match &self.pool {
            DbPool::MySql(p) => p.is_closed(),
            DbPool::Postgres(p) => p.is_closed(),
            DbPool::SQLite(p) => p.is_closed(),
        }
    }

    fn status(&self) -> PoolStatus {
        let (size, idle) = match &self.pool {
            DbPool::MySql(p) => (p.size(), p.num_idle()),
            DbPool::Postgres(p) => (p.size(), p.num_idle()),
            DbPool::SQLite(p) => (p.size(), p.num_idle()),
        };
        PoolStatus {
            max_connections: self.max_connections,
            size,
            idle: idle as u32,
        }
    }
}

/// A leased sqlx connection plus the pool's error observer.
#[derive(Debug)]
pub struct SqlxSession {
    conn: Option<DbConnection>,
    alive: bool,
    observers: Arc<ErrorObserverSlot>,
}

#[async_trait]
impl Session for SqlxSession {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, DriverError> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            DriverError::new(DriverErrorKind::ConnectionClosed, "Session already released")
        })?;

        let result = match conn {
            DbConnection::MySql(c) => fetch_mysql(c, sql, params).await,
            DbConnection::Postgres(c) => fetch_postgres(c, sql, params).await,
            DbConnection::SQLite(c) => fetch_sqlite(c, sql, params).await,
        };

        if let Err(e) = &result {
            if e.is_connection_terminated() {
                self.alive = false;
            }
            self.observers.report(e);
        }
        result
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let millis = timeout.as_millis();
        let sql = match &self.conn {
            Some(DbConnection::Postgres(_)) => format!("SET statement_timeout = {millis}"),
            Some(DbConnection::MySql(_)) => format!("SET SESSION max_execution_time = {millis}"),
            Some(DbConnection::SQLite(_)) => {
                debug!("SQLite has no server-side statement timeout, skipping");
                return Ok(());
            }
            None => {
                return Err(DriverError::new(
                    DriverErrorKind::ConnectionClosed,
                    "Session already released",
                ));
            }
        };
        self.execute(&sql, &[]).await.map(|_| ())
    }

    fn is_alive(&self) -> bool {
        self.alive && self.conn.is_some()
    }

    fn release(mut self: Box<Self>) {
        if let Some(conn) = self.conn.take() {
            if self.alive {
                // Dropping a PoolConnection returns it to its pool
                drop(conn);
            } else {
                conn.detach();
            }
        }
    }

    fn discard(mut self: Box<Self>) {
        if let Some(conn) = self.conn.take() {
            conn.detach();
        }
    }
}

impl Drop for SqlxSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Session dropped without release, discarding it");
            conn.detach();
        }
    }
}

async fn fetch_mysql(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<Vec<Row>, DriverError> {
    let rows = if params.is_empty() {
        sqlx::Executor::fetch_all(&mut *conn, sql).await?
    } else {
        bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *conn)
            .await?
    };
    Ok(rows.iter().map(IntoResultRow::to_result_row).collect())
}

async fn fetch_postgres(
    conn: &mut PgConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<Vec<Row>, DriverError> {
    let rows = if params.is_empty() {
        sqlx::Executor::fetch_all(&mut *conn, sql).await?
    } else {
        bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *conn)
            .await?
    };
    Ok(rows.iter().map(IntoResultRow::to_result_row).collect())
}

async fn fetch_sqlite(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<Vec<Row>, DriverError> {
    let rows = if params.is_empty() {
        sqlx::Executor::fetch_all(&mut *conn, sql).await?
    } else {
        bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *conn)
            .await?
    };
    Ok(rows.iter().map(IntoResultRow::to_result_row).collect())
}
