//! HTTP API.
//!
//! - `POST /v1/agents/:agent/:action` runs one action and answers with an
//!   `AgentReply` envelope. Action failures are still `200 OK`; only a body
//!   that cannot be decoded gets a client error from axum.
//! - `GET /healthz` reports liveness and the mount points currently frozen.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use snapset_core::agent_api::{AgentReply, AgentRequest};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{check_route, ActionHandler};

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub handler: ActionHandler,
    pub start_time: Instant,
    pub requests: AtomicU64,
    pub failures: AtomicU64,
}

impl AppState {
    pub fn new(handler: ActionHandler) -> Self {
        Self {
            handler,
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub hostname: String,
    pub uptime_seconds: u64,
    pub requests: u64,
    pub failures: u64,
    pub frozen: Vec<String>,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/agents/:agent/:action", post(run_action))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, state, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(address = %listener.local_addr()?, "Agent API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// POST /v1/agents/:agent/:action
async fn run_action(
    State(state): State<Arc<AppState>>,
    Path((agent, action)): Path<(String, String)>,
    Json(request): Json<AgentRequest>,
) -> Json<AgentReply> {
    state.requests.fetch_add(1, Ordering::Relaxed);

    let reply = match check_route(&agent, &action, &request) {
        Ok(()) => state.handler.handle(request).await,
        Err(e) => {
            warn!(error = %e, "Rejected request");
            AgentReply::failure(e.to_reply_message())
        }
    };
    if !reply.ok {
        state.failures.fetch_add(1, Ordering::Relaxed);
    }
    Json(reply)
}

/// GET /healthz
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        requests: state.requests.load(Ordering::Relaxed),
        failures: state.failures.load(Ordering::Relaxed),
        frozen: state.handler.frozen().await,
    })
}
