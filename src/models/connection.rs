//! Connection-related data models.
//!
//! This module defines the per-target options that configure a pool and the
//! sessions it hands out, plus small helpers for identifying targets.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// TLS policy for sessions opened by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Disabled,
    /// Encrypt and verify the server certificate and host name.
    Enabled,
    /// Encrypt without verifying the server certificate.
    EnabledNoVerify,
}

impl std::str::FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "disable" | "false" | "off" => Ok(Self::Disabled),
            "enabled" | "enable" | "true" | "on" | "verify" => Ok(Self::Enabled),
            "enabled-no-verify" | "no-verify" | "require" => Ok(Self::EnabledNoVerify),
            other => Err(format!(
                "Unknown TLS mode '{other}' (expected disabled, enabled or enabled-no-verify)"
            )),
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::EnabledNoVerify => write!(f, "enabled-no-verify"),
        }
    }
}

/// Options for a connection target.
///
/// A pool's configuration is fixed when it is created; options passed on a
/// later cache hit are ignored. Session-level settings (`statement_timeout_ms`,
/// `query_timeout_ms`) apply to the connection that supplied them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Maximum concurrent sessions in the pool (default: 10)
    pub max_connections: Option<u32>,
    /// How long an idle pooled session may live, in milliseconds (default: 10000)
    pub idle_timeout_ms: Option<u64>,
    /// How long to wait for a session at checkout, in milliseconds (default: 5000)
    pub connect_timeout_ms: Option<u64>,
    /// Server-side statement timeout applied to each checked-out session
    pub statement_timeout_ms: Option<u64>,
    /// Client-side bound on each query round trip
    pub query_timeout_ms: Option<u64>,
    /// TLS policy. None leaves the decision to the target string.
    pub tls: Option<TlsMode>,
}

impl ConnectionOptions {
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS))
    }

    pub fn connect_timeout_or_default(&self) -> Duration {
        Duration::from_millis(
            self.connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        )
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// Fill every unset field from `fallback`.
    pub fn merged_with(&self, fallback: &ConnectionOptions) -> ConnectionOptions {
        ConnectionOptions {
            max_connections: self.max_connections.or(fallback.max_connections),
            idle_timeout_ms: self.idle_timeout_ms.or(fallback.idle_timeout_ms),
            connect_timeout_ms: self.connect_timeout_ms.or(fallback.connect_timeout_ms),
            statement_timeout_ms: self.statement_timeout_ms.or(fallback.statement_timeout_ms),
            query_timeout_ms: self.query_timeout_ms.or(fallback.query_timeout_ms),
            tls: self.tls.or(fallback.tls),
        }
    }

    /// Validate options, rejecting values no pool can honor.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == Some(0) {
            return Err(DbError::invalid_argument(
                "max_connections must be greater than 0",
            ));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(DbError::invalid_argument(
                "connect_timeout_ms must be greater than 0",
            ));
        }
        if self.statement_timeout_ms == Some(0) {
            return Err(DbError::invalid_argument(
                "statement_timeout_ms must be greater than 0 (omit it to disable)",
            ));
        }
        if self.query_timeout_ms == Some(0) {
            return Err(DbError::invalid_argument(
                "query_timeout_ms must be greater than 0 (omit it to disable)",
            ));
        }
        Ok(())
    }
}

/// Externally visible state of a [`Connection`](crate::db::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No target; queries fail with `NotConnected`.
    Disconnected,
    /// A target and a live session are held.
    Connected,
    /// A target is known but the session is gone; the next operation re-acquires one.
    Degraded,
}

/// Get a display-safe version of a connection string (credentials masked).
pub fn mask_target(target: &str) -> String {
    if let Ok(mut url) = url::Url::parse(target) {
        if url.password().is_some() && url.set_password(Some("****")).is_ok() {
            return url.to_string();
        }
        return target.to_string();
    }
    // Simple masking for strings the URL parser rejects
    if let Some(at_pos) = target.find('@') {
        if let Some(colon_pos) = target[..at_pos].rfind(':') {
            let prefix = &target[..colon_pos + 1];
            let suffix = &target[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
    }
    target.to_string()
}
