//! tollgate: a line-oriented transaction server
//!
//! Serves `PAYMENT|<amount>` requests over TCP, one per line, and shuts down
//! gracefully:
//! - stops accepting as soon as SIGINT or SIGTERM arrives
//! - gives in-flight requests a grace period, then answers `Cancelled`
//! - closes connections as they go idle, bounded by a shutdown timeout
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod handler;
mod protocol;
mod runtime;
mod server;

use config::Config;
use handler::TransactionHandler;
use server::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        grace_period_ms = config.grace_period.as_millis() as u64,
        shutdown_timeout_ms = config.shutdown_timeout.as_millis() as u64,
        "Starting tollgate server"
    );

    let server = Server::with_policy(TransactionHandler::new(&config.transaction), config.drain);

    let mut serving = tokio::spawn({
        let server = server.clone();
        let listen = config.listen.clone();
        let grace_period = config.grace_period;
        async move { server.start(&listen, grace_period).await }
    });

    tokio::select! {
        result = &mut serving => {
            return match result? {
                Err(e) if !e.is_closed() => {
                    error!(error = %e, "Server failed");
                    Err(e.into())
                }
                _ => Ok(()),
            };
        }
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(signal, "Shutting down server");
        }
    }

    match server
        .shutdown(tokio::time::sleep(config.shutdown_timeout))
        .await
    {
        Ok(()) => {
            info!("Server stopped");
            Ok(())
        }
        Err(e) => {
            warn!(
                error = %e,
                remaining = server.active_connections(),
                "Error shutting down server"
            );
            Err(e.into())
        }
    }
}

/// Wait for SIGINT or SIGTERM, returning the signal name.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
