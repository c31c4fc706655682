//! Data models for the session manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ConnectionOptions, ConnectionStatus, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_MS,
    DEFAULT_MAX_CONNECTIONS, DatabaseType, TlsMode, mask_target,
};
pub use query::{QueryOptions, QueryParam, Row};
