//! DB Session Manager - Main entry point.
//!
//! Runs one query or the PostgreSQL diagnostic battery through a pooled
//! connection and prints the result as JSON on stdout. Logs go to stderr.

use db_session_manager::config::{Command, Config, parse_param};
use db_session_manager::db::{Connection, PoolRegistry};
use db_session_manager::diagnostics;
use db_session_manager::models::QueryOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Run the selected command and return the JSON to print.
async fn run(
    config: &Config,
    registry: Arc<PoolRegistry>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let target = config.target_config()?;
    let mut conn = Connection::new(registry);

    match &config.command {
        Command::Analyze => {
            let report = diagnostics::analyze(&mut conn, &target.target, target.options).await?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Query {
            sql,
            params,
            timeout_ms,
        } => {
            let params: Vec<_> = params.iter().map(|p| parse_param(p)).collect();
            let options = QueryOptions {
                timeout: timeout_ms.map(Duration::from_millis),
            };
            conn.connect(&target.target, target.options).await?;
            let rows = conn.query_with_options(sql, &params, &options).await;
            conn.disconnect();
            Ok(serde_json::to_value(rows?)?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!("Starting DB Session Manager v{}", env!("CARGO_PKG_VERSION"));

    let registry =
        Arc::new(PoolRegistry::sqlx().with_close_timeout(config.pool_close_timeout()));

    let outcome = tokio::select! {
        result = run(&config, Arc::clone(&registry)) => Some(result),
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
            None
        }
    };

    info!("Draining connection pools");
    let report = registry.drain_all().await;
    for (target, e) in &report.failures {
        warn!(target = %target, error = %e, "Pool did not close cleanly");
    }

    match outcome {
        Some(Ok(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
        None => Err("Interrupted".into()),
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
