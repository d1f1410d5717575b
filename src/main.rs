//! Agent wallet daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!     agent / skill layer
//!            │  HTTP (api)
//!            ▼
//!    ┌──────────────────────────────────────────────────────────────┐
//!    │ WalletService                                                │
//!    │                                                              │
//!    │  TransactionSubmitter ──▶ SpendingLimitGuard                 │
//!    │        │            └──▶ NonceSequencer  (per wallet/chain)  │
//!    │        ▼                                                     │
//!    │  WalletProvider  Native │ Custodial │ Multisig               │
//!    │        │                     │            │                  │
//!    │        ▼                     ▼            ▼                  │
//!    │  ChainRpc (RpcPool)    custody API   multisig contract       │
//!    │        ▲                                                     │
//!    │  ConfirmationTracker ──▶ TransactionLog (journal)            │
//!    └──────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use agent_wallet::chain::{ChainRpc, RpcPool};
use agent_wallet::config::watcher::ConfigWatcher;
use agent_wallet::config::{load_config, AppConfig};
use agent_wallet::lifecycle::{spawn_signal_handler, Shutdown};
use agent_wallet::observability::{logging, metrics};
use agent_wallet::wallet::WalletRegistry;
use agent_wallet::{api, WalletService};

#[derive(Parser)]
#[command(name = "agent-wallet")]
#[command(about = "Transaction layer for agent-controlled wallets", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "agent-wallet.toml")]
    config: PathBuf,

    /// Seconds to wait for in-flight work on shutdown.
    #[arg(long, default_value_t = 30)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        chains = config.chains.len(),
        wallets = config.wallets.len(),
        "agent-wallet starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let pool = Arc::new(RpcPool::connect(&config.chains).await?);
    let rpc: Arc<dyn ChainRpc> = pool.clone();
    let registry = Arc::new(WalletRegistry::from_config(&config, rpc.clone())?);
    let service = Arc::new(WalletService::start(&config, registry, rpc).await?);

    let shutdown = Shutdown::new(Duration::from_secs(cli.grace_secs));
    let (hangup_tx, mut hangup_rx) = mpsc::unbounded_channel();
    spawn_signal_handler(shutdown.clone(), hangup_tx);

    let (watcher, mut reload_rx) = ConfigWatcher::new(&cli.config, &config);
    let _watcher_guard = match watcher.run() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable; reload with SIGHUP");
            None
        }
    };

    spawn_rpc_health(pool, shutdown.clone());

    let api_task = if config.api.enabled {
        let listener = TcpListener::bind(&config.api.bind_address).await?;
        let service = service.clone();
        let api_config = config.api.clone();
        let token = shutdown.token();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(listener, service, &api_config, token).await {
                tracing::error!(error = %e, "HTTP API failed");
            }
        }))
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            Some(new_config) = reload_rx.recv() => apply_reload(&service, &new_config).await,
            Some(()) = hangup_rx.recv() => match load_config(&cli.config) {
                Ok(new_config) => apply_reload(&service, &new_config).await,
                Err(e) => tracing::error!(error = %e, "Reload failed. Keeping current configuration."),
            },
        }
    }

    tracing::info!("Shutting down");
    if let Some(task) = api_task {
        let _ = task.await;
    }
    shutdown.drain(service.shutdown()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn apply_reload(service: &WalletService, config: &AppConfig) {
    if let Err(e) = service.reload(config).await {
        tracing::error!(error = %e, "Failed to apply reloaded configuration");
    }
}

fn spawn_rpc_health(pool: Arc<RpcPool>, shutdown: Shutdown) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let healthy = pool.check_health().await;
                    tracing::debug!(healthy, "RPC health probed");
                }
            }
        }
    });
}
