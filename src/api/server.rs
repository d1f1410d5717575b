//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the Axum router over a [`WalletService`]
//! - Wire up middleware (tracing, timeouts, bearer auth)
//! - Serve until the shutdown token fires

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::api::auth::api_auth_middleware;
use crate::api::handlers::*;
use crate::config::schema::ApiConfig;
use crate::service::WalletService;

/// State injected into handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<WalletService>,
    pub api_key: Arc<str>,
}

/// Build the router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(service: Arc<WalletService>, config: &ApiConfig) -> Router {
    let state = ApiState {
        service,
        api_key: Arc::from(config.api_key.as_str()),
    };

    let protected = Router::new()
        .route("/v1/transfers", post(submit_transfer))
        .route("/v1/transactions/{id}", get(get_transaction))
        .route("/v1/transactions/{id}/resubmit", post(resubmit_transaction))
        .route("/v1/transactions/{id}/watch", delete(cancel_watch))
        .route("/v1/wallets", get(list_wallets))
        .route("/v1/wallets/{wallet_id}/limits/{token}", put(configure_limit))
        .layer(middleware::from_fn_with_state(state.clone(), api_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    service: Arc<WalletService>,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP API starting");

    let app = build_router(service, config);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP API stopped");
    Ok(())
}
