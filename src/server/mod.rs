//! HTTP server for the query engine API

pub mod agent;
pub mod ancillary;

use axum::{
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::orchestrator::Engine;
use crate::ratelimit::RateLimiter;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub limiter: Arc<RateLimiter>,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Query orchestration, one endpoint per agent flavour
        .route("/api/agent/:flavour", post(agent::handle_agent))
        .route("/api/agent/:flavour/", post(agent::handle_agent))
        // Failure → ticket workflow
        .route("/api/agent-failure", post(ancillary::record_failure))
        .route("/api/agent-failure/", post(ancillary::record_failure))
        .route(
            "/api/agent-failure/:id/create-ticket",
            post(ancillary::create_ticket),
        )
        .route(
            "/api/agent-failure/:id/decline",
            patch(ancillary::decline_failure),
        )
        // Feedback
        .route("/api/feedback", post(ancillary::record_feedback))
        .route("/api/feedback/", post(ancillary::record_feedback))
        // Session termination
        .route("/api/sessions/end", post(ancillary::end_session))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(engine: Arc<Engine>, limiter: Arc<RateLimiter>, host: &str, port: u16) -> Result<()> {
    let app = router(AppState { engine, limiter });

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
