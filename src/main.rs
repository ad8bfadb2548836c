//! game-gate: A TCP gateway for game servers
//!
//! Clients connect over TCP and speak length-prefixed, RC4-encrypted
//! frames. Every connection is bound to a session taken from a fixed
//! pool; the session decrypts client traffic, forwards it to the game
//! backend and writes backend replies back to the client.
//!
//! Features:
//! - Pre-allocated session pool with periodic reclamation
//! - Per-session actor loop with a die signal
//! - 2-byte big-endian length framing
//! - Configuration via CLI arguments or TOML file

mod backend;
mod config;
mod constants;
mod crypto;
mod frame;
mod pool;
mod server;
mod session;
mod task;

use config::{Config, LogFormat};
use crypto::SessionKey;
use pool::{PoolConfig, SessionPool};
use server::Server;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    info!(
        listen = %config.listen,
        gate_id = config.gate_id,
        capacity = config.capacity,
        workers = config.workers,
        registry = %config.registry,
        read_timeout = config.read_timeout,
        sweep_interval = config.sweep_interval,
        "Starting game-gate"
    );

    // A bad key must stop startup, never a session.
    let key = SessionKey::new(&config.crypto_key).map_err(|e| {
        error!(error = %e, "Unusable crypto key");
        e
    })?;

    let runtime = if config.workers == 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers)
            .enable_all()
            .build()?
    };

    runtime.block_on(run(config, key))?;
    info!("Gateway stopped");
    Ok(())
}

async fn run(config: Config, key: SessionKey) -> std::io::Result<()> {
    let (uplink, uplink_rx) = backend::uplink(config.uplink_depth);
    tokio::spawn(backend::drain_uplink(uplink_rx, config.registry.clone()));

    let pool = SessionPool::new(
        PoolConfig {
            gate_id: config.gate_id,
            capacity: config.capacity,
            max_packets_per_minute: config.max_packets_per_minute,
        },
        key,
        uplink,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for ctrl-c; running until killed");
                // Keep the sender alive so the server is not told to stop.
                let _keep = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    Server::new(&config, pool).run(shutdown_rx).await
}
