//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with every escrow endpoint
//! - Wire up middleware (request ID, tracing, timeout, body limit)
//! - Serve plain TCP or TLS (axum-server + rustls)
//! - Stop accepting and drain on the shutdown signal

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::audit::AuditLog;
use crate::config::ListenerConfig;
use crate::escrow::EscrowEngine;
use crate::health::HealthMonitor;
use crate::http::handlers;
use crate::http::request::{make_request_span, propagate_request_id_layer, set_request_id_layer};
use crate::security::RateLimiter;

const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EscrowEngine>,
    pub limiter: Arc<RateLimiter>,
    pub audit: AuditLog,
    pub health: Arc<HealthMonitor>,
}

/// HTTP server for the escrow API.
pub struct HttpServer {
    router: Router,
    config: ListenerConfig,
}

impl HttpServer {
    pub fn new(state: AppState, config: ListenerConfig) -> Self {
        let router = Self::build_router(&config, state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Outermost first: request ID is assigned before the span opens, so every
    /// log line carries it. The body limit sits outside the timeout because
    /// `TimeoutLayer` needs a response body with a `Default` impl.
    #[allow(deprecated)]
    pub fn build_router(config: &ListenerConfig, state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/escrows", post(handlers::create_escrow))
            .route("/escrows/{id}", get(handlers::get_escrow))
            .route("/escrows/{id}/fund", post(handlers::fund_escrow))
            .route("/escrows/{id}/release", post(handlers::release_escrow))
            .route("/escrows/{id}/cancel", post(handlers::cancel_escrow))
            .route("/escrows/{id}/dispute", post(handlers::open_dispute))
            .route("/escrows/{id}/balance", get(handlers::check_balance))
            .route("/escrows/{id}/audit", get(handlers::escrow_audit))
            .route("/milestones/{id}/complete", post(handlers::complete_milestone))
            .route("/milestones/{id}/release", post(handlers::release_milestone))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(set_request_id_layer())
                    .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
                    .layer(propagate_request_id_layer())
                    .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
                    .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs))),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve plain HTTP on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS using the configured certificate and key.
    pub async fn run_tls(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let tls = self.config.tls.clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "listener.tls is not configured")
        })?;
        let addr: SocketAddr = self.config.bind_address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid bind address {}: {}", self.config.bind_address, e),
            )
        })?;
        let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
        });

        tracing::info!(address = %addr, "HTTPS server starting");
        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    for (what, path) in [("Certificate", cert_path), ("Private key", key_path)] {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} file not found: {}", what, path.display()),
            ));
        }
    }
    RustlsConfig::from_pem_file(cert_path, key_path).await
}
