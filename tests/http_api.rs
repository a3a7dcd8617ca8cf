//! HTTP surface tests over the in-memory engine

mod common;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::harness;
use kbase::clients::DurableStore;
use kbase::config::RateLimits;
use kbase::server::{router, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower::ServiceExt;

fn app(limits: Option<RateLimits>) -> (Router, common::Harness) {
    let h = harness(limits);
    let app = router(AppState {
        engine: h.engine.clone(),
        limiter: h.limiter.clone(),
    })
    .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
    (app, h)
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, value)
}

#[tokio::test]
async fn test_flavour_shapes() {
    let (app, _h) = app(None);
    let body = json!({"message": "how do I upload photos"});

    let (status, headers, test_body) =
        post_json(&app, "/api/agent/test/", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-ratelimit-limit"));
    assert_eq!(test_body["query_type"], "howto");
    assert!(test_body.get("debug_metrics").is_some());
    assert_eq!(
        test_body["debug_metrics"]["search_execution"]["attempts"][0]["filter"]["entry_type"],
        "how_to"
    );
    assert!(test_body["requires_escalation"] == false);

    let (status, _, support_body) =
        post_json(&app, "/api/agent/support/", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(support_body.get("confidence").is_some());
    assert!(support_body["sources"][0].get("title").is_some());
    assert!(support_body.get("debug_metrics").is_none());

    let (status, _, customer_body) = post_json(&app, "/api/agent/customer/", body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(customer_body.get("response").is_some());
    assert!(customer_body.get("session_id").is_some());
    assert!(customer_body.get("confidence").is_none());
    assert!(customer_body.get("sources").is_none());
}

#[tokio::test]
async fn test_unknown_flavour_404() {
    let (app, _h) = app(None);
    let (status, _, _) = post_json(&app, "/api/agent/admin/", json!({"message": "hi"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_message_validation_boundaries() {
    let (app, _h) = app(None);

    let (status, _, body) = post_json(&app, "/api/agent/test/", json!({"message": ""})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let exactly = "x".repeat(4000);
    let (status, _, _) =
        post_json(&app, "/api/agent/test/", json!({"message": exactly})).await;
    assert_eq!(status, StatusCode::OK);

    let too_long = "x".repeat(4001);
    let (status, _, _) =
        post_json(&app, "/api/agent/test/", json!({"message": too_long})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_boundary_and_headers() {
    let mut limits = RateLimits::default();
    limits.query.limit = 2;
    let (app, _h) = app(Some(limits));

    let body = json!({"message": "hello", "user_info": {"agent_id": "agent-9"}});
    for _ in 0..2 {
        let (status, headers, _) = post_json(&app, "/api/agent/customer/", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.contains_key("x-ratelimit-remaining"));
    }

    let (status, headers, denied) = post_json(&app, "/api/agent/customer/", body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied["limit"], 2);
    assert_eq!(denied["remaining"], 0);
    assert!(denied["reset_in_seconds"].as_u64().unwrap() > 0);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_session_continuity_over_http() {
    let (app, _h) = app(None);

    let (_, _, first) = post_json(
        &app,
        "/api/agent/test/",
        json!({"message": "how do I upload photos"}),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    let (status, _, second) = post_json(
        &app,
        "/api/agent/test/",
        json!({"message": "more photo questions", "session_id": session_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["session_id"], session_id.as_str());
    assert!(second["context_debug"]["recent_count"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_failure_ticket_workflow() {
    let (app, h) = app(None);

    let (_, _, first) = post_json(
        &app,
        "/api/agent/test/",
        json!({"message": "how do I upload photos"}),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    let (status, failure_headers, failure) = post_json(
        &app,
        "/api/agent-failure/",
        json!({"session_id": session_id, "query": "obscure", "reason": "no_results"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(failure_headers.contains_key("x-ratelimit-limit"));
    let failure_id = failure["failure_id"].as_str().unwrap().to_string();

    let (status, _, ticket) = post_json(
        &app,
        &format!("/api/agent-failure/{failure_id}/create-ticket"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ticket["ticket_requested"], true);

    // Ticket creation ended the session
    let header = h.durable.session_header(&session_id).await.unwrap().unwrap();
    assert!(header.is_ended());

    // Unknown failure id is a 404
    let (status, _, _) = post_json(
        &app,
        "/api/agent-failure/nope/create-ticket",
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_decline_failure() {
    let (app, _h) = app(None);
    let (_, _, failure) = post_json(
        &app,
        "/api/agent-failure/",
        json!({"session_id": "s1", "query": "q", "reason": "low_confidence"}),
    )
    .await;
    let failure_id = failure["failure_id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/agent-failure/{failure_id}/decline"))
                .header("content-type", "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
}

#[tokio::test]
async fn test_feedback_endpoint() {
    let (app, h) = app(None);
    let (status, headers, body) = post_json(
        &app,
        "/api/feedback/",
        json!({"session_id": "s1", "rating": "up", "comment": "helpful"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-ratelimit-limit"));
    assert!(body.get("feedback_id").is_some());
    assert_eq!(h.durable.feedback_count(), 1);

    // Invalid rating still carries the rate-limit headers
    let (status, headers, _) = post_json(
        &app,
        "/api/feedback/",
        json!({"session_id": "s1", "rating": "sideways"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(headers.contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn test_end_session_endpoint() {
    let (app, h) = app(None);
    let (_, _, first) = post_json(
        &app,
        "/api/agent/test/",
        json!({"message": "how do I upload photos"}),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    let (status, headers, body) = post_json(
        &app,
        "/api/sessions/end",
        json!({"session_id": session_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-ratelimit-limit"));
    assert_eq!(body["ended"], true);
    assert_eq!(h.durable.stored_metrics(&session_id).len(), 1);
}

#[tokio::test]
async fn test_default_class_rate_limit_on_ancillary() {
    let mut limits = RateLimits::default();
    limits.default.limit = 1;
    let (app, _h) = app(Some(limits));

    let (status, headers, _) =
        post_json(&app, "/api/sessions/end", json!({"session_id": "s1"})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-ratelimit-limit"));

    let (status, headers, denied) =
        post_json(&app, "/api/sessions/end", json!({"session_id": "s1"})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied["remaining"], 0);
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_health() {
    let (app, _h) = app(None);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
