//! Escrow custody service.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http (Axum, actor + rate limit)
//!                          │
//!                          ▼
//!                     escrow::EscrowEngine ──────▶ audit::AuditLog ──▶ store
//!                          │        │
//!                          │        └──────────▶ webhooks (signed, async)
//!                          ▼
//!                 payments::TransactionDispatcher
//!                     │            │
//!                     ▼            ▼
//!              custody::KeyVault   blockchain::ChainRpc ──▶ EVM node
//!
//!     Background: sweeps (auto-release, funding, payout recovery),
//!                 health monitor, audit retention, config watcher
//!     Operators:  admin API (Bearer key) + escrow-cli
//! ```
//!
//! # Startup Order
//! 1. Config (file or defaults) and logging
//! 2. Master secret from the environment; vault self-test (fatal on failure)
//! 3. RPC client, store, audit outbox
//! 4. Dispatcher, webhooks, engine, rate limiter
//! 5. Background tasks, then listeners

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use escrow_custody::admin::{admin_router, AdminState};
use escrow_custody::audit::AuditLog;
use escrow_custody::blockchain::{AlloyRpcClient, ChainRpc};
use escrow_custody::config::validation::validate_config;
use escrow_custody::config::watcher::ConfigWatcher;
use escrow_custody::config::{load_config, ServiceConfig};
use escrow_custody::custody::{KeyVault, MasterSecret};
use escrow_custody::escrow::{EngineSettings, EscrowEngine, Sweeper};
use escrow_custody::health::HealthMonitor;
use escrow_custody::http::{AppState, HttpServer};
use escrow_custody::lifecycle::{wait_for_shutdown_signal, Shutdown};
use escrow_custody::observability::{logging, metrics};
use escrow_custody::payments::TransactionDispatcher;
use escrow_custody::resilience::RetryPolicy;
use escrow_custody::security::RateLimiter;
use escrow_custody::store::MemoryStore;
use escrow_custody::webhooks::WebhookNotifier;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "escrow-custody")]
#[command(about = "Escrow custody service", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ESCROW_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let config = ServiceConfig::default();
            if let Err(errors) = validate_config(&config) {
                for e in &errors {
                    eprintln!("config error: {}", e);
                }
                return Err("default configuration is invalid".into());
            }
            config
        }
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "escrow-custody starting");

    // Custody: no secret, no service.
    let secret = MasterSecret::from_env(&config.custody.master_secret_env).map_err(|e| {
        tracing::error!(env = %config.custody.master_secret_env, error = %e, "Master secret unavailable");
        e
    })?;
    let vault = Arc::new(KeyVault::new(secret));
    vault.self_test()?;
    tracing::info!("Key vault self-test passed");

    let rpc: Arc<dyn ChainRpc> = Arc::new(AlloyRpcClient::new(config.blockchain.clone()).await?);

    let store = Arc::new(match &config.store.snapshot_path {
        Some(path) => MemoryStore::open(path)?,
        None => MemoryStore::new(),
    });

    let shutdown = Shutdown::new();
    let mut background = Vec::new();

    let (audit, audit_worker) = AuditLog::start(store.clone(), config.audit.channel_capacity);

    let dispatcher = Arc::new(
        TransactionDispatcher::new(
            store.clone(),
            store.clone(),
            vault.clone(),
            rpc.clone(),
            audit.clone(),
            RetryPolicy::from(&config.retries),
        )
        .with_confirmation_tracking(u64::from(config.blockchain.confirmation_blocks)),
    );

    let webhooks = WebhookNotifier::new(&config.webhooks)?;
    tracing::info!(subscribers = webhooks.subscriber_count(), "Webhook notifier ready");

    let engine = Arc::new(EscrowEngine::new(
        store.clone(),
        vault.clone(),
        rpc.clone(),
        dispatcher,
        audit.clone(),
        webhooks,
        EngineSettings::from_config(&config),
    ));

    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    background.push(limiter.spawn_cleanup(LIMITER_CLEANUP_INTERVAL, shutdown.subscribe()));

    // Hot reload applies to rate-limit policies only.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path, config.rate_limit.clone());
            let limiter = limiter.clone();
            tokio::spawn(async move {
                while let Some(rate_limit) = updates.recv().await {
                    limiter.update_policies(&rate_limit);
                }
            });
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable; hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let processing_timeout = Duration::from_secs(config.retries.processing_timeout_secs);
    background.extend(Sweeper::new(engine.clone(), config.sweeps.clone(), processing_timeout).spawn(shutdown.sender()));

    let health = Arc::new(HealthMonitor::new(vault.clone(), rpc.clone(), audit.clone()));
    background.push(tokio::spawn(health.clone().run(HEALTH_INTERVAL, shutdown.subscribe())));

    background.push(audit.spawn_retention(
        config.audit.retention_days,
        Duration::from_secs(config.audit.retention_interval_secs.max(1)),
        shutdown.subscribe(),
    ));

    if config.store.snapshot_path.is_some() {
        let store = store.clone();
        let mut stop = shutdown.subscribe();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.save_snapshot().await {
                            tracing::error!(error = %e, "Periodic snapshot failed");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        }));
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    if config.admin.enabled {
        let admin = admin_router(AdminState {
            engine: engine.clone(),
            audit: audit.clone(),
            health: health.clone(),
            api_key: Arc::new(config.admin.api_key.clone()),
            processing_timeout,
        });
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %config.admin.bind_address, "Admin API listening");
        let mut stop = shutdown.subscribe();
        background.push(tokio::spawn(async move {
            let served = axum::serve(listener, admin)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
    }

    let server = HttpServer::new(
        AppState {
            engine,
            limiter,
            audit: audit.clone(),
            health,
        },
        config.listener.clone(),
    );

    let server_task = if config.listener.tls.is_some() {
        tokio::spawn(server.run_tls(shutdown.subscribe()))
    } else {
        let listener = TcpListener::bind(&config.listener.bind_address).await?;
        tokio::spawn(server.run(listener, shutdown.subscribe()))
    };

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down");
    shutdown.trigger();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server exited with error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
    }
    Shutdown::drain(background, SHUTDOWN_DEADLINE).await;

    if tokio::time::timeout(SHUTDOWN_DEADLINE, audit.flush()).await.is_err() {
        tracing::warn!(pending = audit.depth(), "Audit outbox did not drain before the deadline");
    }
    audit_worker.abort();

    if let Err(e) = store.save_snapshot().await {
        tracing::error!(error = %e, "Final snapshot failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
