//! Ancillary endpoints: failure → ticket workflow, feedback, session end
//!
//! These consume the orchestrator's escalation signal; the ticket subsystem
//! itself is external. Every handler counts against a rate-limit window and
//! attaches the rate-limit headers to its response, denied or not.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::agent::{rate_limit_headers, rate_limited_response};
use super::AppState;
use crate::clients::FeedbackRating;
use crate::ratelimit::EndpointClass;
use crate::session::EndReason;

fn internal_error(headers: HeaderMap, e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "ancillary endpoint failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        Json(json!({"error": "internal_error", "message": "Something went wrong."})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct FailureBody {
    pub session_id: String,
    pub query: String,
    pub reason: String,
}

/// POST /api/agent-failure/
pub async fn record_failure(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<FailureBody>,
) -> Response {
    let decision = state
        .limiter
        .check(&addr.ip().to_string(), EndpointClass::Default)
        .await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }
    let headers = rate_limit_headers(&decision);

    if body.session_id.is_empty() || body.query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            headers,
            Json(json!({"error": "validation_error", "message": "session_id and query are required"})),
        )
            .into_response();
    }
    match state
        .engine
        .record_failure(&body.session_id, &body.query, &body.reason)
        .await
    {
        Ok(failure_id) => (
            StatusCode::OK,
            headers,
            Json(json!({"failure_id": failure_id})),
        )
            .into_response(),
        Err(e) => internal_error(headers, e),
    }
}

/// POST /api/agent-failure/{id}/create-ticket
pub async fn create_ticket(
    State(state): State<AppState>,
    Path(failure_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let decision = state
        .limiter
        .check(&addr.ip().to_string(), EndpointClass::Ticket)
        .await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }
    let headers = rate_limit_headers(&decision);

    match state.engine.create_ticket(&failure_id).await {
        Ok(true) => (
            StatusCode::OK,
            headers,
            Json(json!({"failure_id": failure_id, "ticket_requested": true})),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            headers,
            Json(json!({"error": "not_found", "message": "unknown failure id"})),
        )
            .into_response(),
        Err(e) => internal_error(headers, e),
    }
}

/// PATCH /api/agent-failure/{id}/decline
pub async fn decline_failure(
    State(state): State<AppState>,
    Path(failure_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let decision = state
        .limiter
        .check(&addr.ip().to_string(), EndpointClass::Default)
        .await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }
    let headers = rate_limit_headers(&decision);

    match state.engine.decline_failure(&failure_id).await {
        Ok(true) => (
            StatusCode::OK,
            headers,
            Json(json!({"failure_id": failure_id, "declined": true})),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            headers,
            Json(json!({"error": "not_found", "message": "unknown failure id"})),
        )
            .into_response(),
        Err(e) => internal_error(headers, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub session_id: String,
    pub rating: String,
    pub comment: Option<String>,
}

/// POST /api/feedback/
pub async fn record_feedback(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<FeedbackBody>,
) -> Response {
    let decision = state
        .limiter
        .check(&addr.ip().to_string(), EndpointClass::Feedback)
        .await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }
    let headers = rate_limit_headers(&decision);

    let rating = match body.rating.as_str() {
        "up" => FeedbackRating::Up,
        "down" => FeedbackRating::Down,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                headers,
                Json(json!({"error": "validation_error", "message": "rating must be 'up' or 'down'"})),
            )
                .into_response()
        }
    };

    match state
        .engine
        .record_feedback(&body.session_id, rating, body.comment)
        .await
    {
        Ok(feedback_id) => (
            StatusCode::OK,
            headers,
            Json(json!({"feedback_id": feedback_id})),
        )
            .into_response(),
        Err(e) => internal_error(headers, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EndSessionBody {
    pub session_id: String,
}

/// POST /api/sessions/end
///
/// Marks the session ended and triggers the batch analytics flush.
pub async fn end_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<EndSessionBody>,
) -> Response {
    let decision = state
        .limiter
        .check(&addr.ip().to_string(), EndpointClass::Default)
        .await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }
    let headers = rate_limit_headers(&decision);

    if body.session_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            headers,
            Json(json!({"error": "validation_error", "message": "session_id is required"})),
        )
            .into_response();
    }
    match state
        .engine
        .end_session(&body.session_id, EndReason::ClientRequested)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            headers,
            Json(json!({"session_id": body.session_id, "ended": true})),
        )
            .into_response(),
        Err(e) => internal_error(headers, e),
    }
}
