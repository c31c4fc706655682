//! PostgreSQL diagnostics.
//!
//! Runs a fixed, read-only battery of catalog queries through a
//! [`Connection`] and collects the answers into a [`DiagnosticReport`].
//! The connection is always disconnected afterwards, whether the battery
//! succeeded or not.
//!
//! SQL text lives in the `queries` submodule.

use crate::db::Connection;
use crate::error::{DbError, DbResult, DriverError, DriverErrorKind};
use crate::models::{ConnectionOptions, DatabaseType, Row, mask_target};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// SQLSTATE for a missing relation.
const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

/// Number of tables listed in [`DiagnosticReport::largest_tables`].
pub const LARGEST_TABLES_LIMIT: i64 = 10;

mod queries {
    pub const SERVER_VERSION: &str = "SELECT version()";

    pub const SETTINGS: &str = r#"
        SELECT name, setting, unit
        FROM pg_settings
        WHERE name IN (
            'max_connections',
            'shared_buffers',
            'effective_cache_size',
            'work_mem',
            'maintenance_work_mem',
            'statement_timeout',
            'idle_in_transaction_session_timeout',
            'ssl'
        )
        ORDER BY name
    "#;

    pub const CACHE_HIT_RATIO: &str = r#"
        SELECT (sum(heap_blks_hit) * 100.0
                / nullif(sum(heap_blks_hit) + sum(heap_blks_read), 0))::float8 AS ratio
        FROM pg_statio_user_tables
    "#;

    pub const LARGEST_TABLES: &str = r#"
        SELECT
            schemaname AS schema,
            relname AS name,
            pg_total_relation_size(relid) AS total_bytes,
            pg_size_pretty(pg_total_relation_size(relid)) AS total_size
        FROM pg_statio_user_tables
        ORDER BY pg_total_relation_size(relid) DESC
        LIMIT $1
    "#;

    pub const SUPERUSERS: &str = "SELECT rolname FROM pg_roles WHERE rolsuper ORDER BY rolname";

    pub const TLS: &str =
        "SELECT ssl, version, cipher FROM pg_stat_ssl WHERE pid = pg_backend_pid()";
}

/// One server setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSetting {
    pub name: String,
    pub setting: String,
    pub unit: Option<String>,
}

/// Size of one user table, indexes and TOAST included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSize {
    pub schema: String,
    pub name: String,
    pub total_bytes: i64,
    pub total_size: String,
}

/// Whether the diagnostic session itself is encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TlsStatus {
    Enabled {
        version: Option<String>,
        cipher: Option<String>,
    },
    /// The server supports TLS reporting and this session is plaintext.
    Disabled,
    /// The server cannot say (no `pg_stat_ssl`, or no row for this backend).
    Unsupported { reason: String },
}

#[derive(Debug, Deserialize)]
struct TlsRow {
    ssl: Option<bool>,
    version: Option<String>,
    cipher: Option<String>,
}

/// Result of [`analyze`].
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// Credential-masked target.
    pub target: String,
    pub server_version: String,
    pub settings: Vec<ServerSetting>,
    /// Percentage of heap block reads served from shared buffers; None without reads.
    pub cache_hit_ratio: Option<f64>,
    pub largest_tables: Vec<TableSize>,
    pub superusers: Vec<String>,
    pub tls: TlsStatus,
    pub elapsed_ms: u64,
}

/// Connect `conn` to `target`, run the battery and disconnect.
pub async fn analyze(
    conn: &mut Connection,
    target: &str,
    options: ConnectionOptions,
) -> DbResult<DiagnosticReport> {
    if DatabaseType::from_connection_string(target) != Some(DatabaseType::PostgreSQL) {
        return Err(DbError::invalid_argument(
            "Diagnostics require a PostgreSQL target (postgres:// or postgresql://)",
        ));
    }

    let start = Instant::now();
    conn.connect(target, options).await?;
    let result = run_battery(conn, mask_target(target), start).await;
    conn.disconnect();

    if let Ok(report) = &result {
        info!(
            target = %report.target,
            elapsed_ms = report.elapsed_ms,
            "Diagnostics complete"
        );
    }
    result
}

async fn run_battery(
    conn: &mut Connection,
    target: String,
    start: Instant,
) -> DbResult<DiagnosticReport> {
    let server_version = conn
        .query_value::<String>(queries::SERVER_VERSION, &[])
        .await?
        .unwrap_or_default();
    debug!(version = %server_version, "Got server version");

    let settings = decode_rows(conn.query(queries::SETTINGS, &[]).await?, &target)?;

    let cache_hit_ratio = conn
        .query_value::<Option<f64>>(queries::CACHE_HIT_RATIO, &[])
        .await?
        .flatten();

    let largest_tables = decode_rows(
        conn.query(queries::LARGEST_TABLES, &[LARGEST_TABLES_LIMIT.into()])
            .await?,
        &target,
    )?;

    let superusers = conn
        .query(queries::SUPERUSERS, &[])
        .await?
        .iter()
        .filter_map(|row| row.get_as::<String>("rolname"))
        .collect();

    let tls = probe_tls(conn, &target).await?;

    Ok(DiagnosticReport {
        target,
        server_version,
        settings,
        cache_hit_ratio,
        largest_tables,
        superusers,
        tls,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Report whether this session uses TLS.
///
/// A missing `pg_stat_ssl` view is `Unsupported`, not an error.
pub async fn probe_tls(conn: &mut Connection, target: &str) -> DbResult<TlsStatus> {
    let row = match conn.query_one(queries::TLS, &[]).await {
        Ok(row) => row,
        Err(e)
            if e.driver_error().and_then(|d| d.sql_state.as_deref())
                == Some(SQLSTATE_UNDEFINED_TABLE) =>
        {
            return Ok(TlsStatus::Unsupported {
                reason: "Server has no pg_stat_ssl view".to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    let Some(row) = row else {
        return Ok(TlsStatus::Unsupported {
            reason: "pg_stat_ssl has no row for this backend".to_string(),
        });
    };
    let tls: TlsRow = decode_row(&row, target)?;
    Ok(match tls.ssl {
        Some(true) => TlsStatus::Enabled {
            version: tls.version,
            cipher: tls.cipher,
        },
        Some(false) => TlsStatus::Disabled,
        None => TlsStatus::Unsupported {
            reason: "pg_stat_ssl did not report an ssl flag".to_string(),
        },
    })
}

fn decode_row<T: DeserializeOwned>(row: &Row, target: &str) -> DbResult<T> {
    row.decode().map_err(|e| {
        DbError::query_failed(
            target,
            DriverError::new(
                DriverErrorKind::Decode,
                format!("Unexpected diagnostic row shape: {e}"),
            ),
        )
    })
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>, target: &str) -> DbResult<Vec<T>> {
    rows.iter().map(|row| decode_row(row, target)).collect()
}
