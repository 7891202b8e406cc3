//! HTTP transport for the Munin bookkeeping assistant.
//!
//! Clients hold no session with this server. Each request carries the whole
//! conversation transcript; the response streams the turn's progress and
//! ends with the transcript to post back next time.
//!
//! # Endpoints
//!
//! - `GET /health` - liveness, uptime and the active triage backend
//! - `POST /api/v1/turns` - process one turn, streamed as Server-Sent Events
//!
//! # Architecture
//!
//! ```text
//! Client (chat UI, bot, curl)
//!    │  POST /api/v1/turns { transcript, attachments }
//!    ▼
//! ┌─────────────────┐
//! │   API server    │ ◄── this crate (axum, SSE out)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐      ┌──────────────────┐
//! │   Coordinator   │─────►│ DelegationChannel │──► six workers ──► ledger
//! └─────────────────┘      └──────────────────┘
//! ```
//!
//! Rate limiting is per client IP: a sliding request window plus a cap on
//! concurrently open turn streams, with request bodies bounded well above
//! the size of a typical attachment batch.

pub mod rate_limit;
pub mod routes;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use state::AppState;

/// Build the router: both endpoints plus the body-limit, trace and CORS
/// layers.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/turns", post(routes::post_turn))
        .layer(DefaultBodyLimit::max(state.limiter.max_body_size()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
///
/// The listener is wired with `ConnectInfo` so handlers see the client IP
/// for rate limiting.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = create_router(state);

    info!(%addr, "starting Munin API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
