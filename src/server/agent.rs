//! Agent query endpoints
//!
//! One orchestration endpoint per agent flavour. The flavours share a single
//! code path parameterised by an immutable profile selecting the audience
//! filter, the rate-limit class, and how much telemetry the response exposes.

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

use super::AppState;
use crate::error::Error;
use crate::kb::UserType;
use crate::orchestrator::{QueryOutcome, QueryRequest};
use crate::ratelimit::{select_identity, EndpointClass, RateDecision};

/// Agent flavour selected by the URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFlavour {
    Test,
    Support,
    Customer,
}

impl AgentFlavour {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(AgentFlavour::Test),
            "support" => Some(AgentFlavour::Support),
            "customer" => Some(AgentFlavour::Customer),
            _ => None,
        }
    }
}

/// Immutable per-flavour configuration
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    pub flavour: AgentFlavour,
    pub audience: UserType,
    pub rate_class: EndpointClass,
}

impl AgentProfile {
    pub fn for_flavour(flavour: AgentFlavour) -> Self {
        match flavour {
            AgentFlavour::Test => Self {
                flavour,
                audience: UserType::Internal,
                rate_class: EndpointClass::Query,
            },
            AgentFlavour::Support => Self {
                flavour,
                audience: UserType::Internal,
                rate_class: EndpointClass::Query,
            },
            AgentFlavour::Customer => Self {
                flavour,
                audience: UserType::External,
                rate_class: EndpointClass::Query,
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UserInfo {
    pub agent_id: Option<String>,
    pub email: Option<String>,
    #[allow(dead_code)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentQueryBody {
    pub message: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Attach the rate-limit headers required on every response
pub fn rate_limit_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let entries = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_epoch_s.to_string()),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if !decision.allowed {
        if let Ok(value) = HeaderValue::from_str(&decision.reset_in_seconds.to_string()) {
            headers.insert("retry-after", value);
        }
    }
    headers
}

pub fn rate_limited_response(decision: &RateDecision) -> Response {
    let body = json!({
        "error": "rate_limited",
        "message": "Rate limit exceeded. Try again later.",
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset_in_seconds": decision.reset_in_seconds,
    });
    (
        StatusCode::TOO_MANY_REQUESTS,
        rate_limit_headers(decision),
        Json(body),
    )
        .into_response()
}

/// Shape the engine outcome for one flavour
fn shape_response(profile: &AgentProfile, outcome: &QueryOutcome) -> serde_json::Value {
    let mut body = json!({
        "response": outcome.response_text,
        "session_id": outcome.session_id,
        "timestamp": Utc::now().to_rfc3339(),
        "requires_escalation": outcome.requires_escalation,
    });
    let object = body.as_object_mut().expect("body is an object");

    match profile.flavour {
        AgentFlavour::Customer => {}
        AgentFlavour::Support => {
            object.insert("confidence".into(), json!(outcome.confidence));
            object.insert(
                "sources".into(),
                json!(outcome
                    .sources
                    .iter()
                    .map(|s| json!({
                        "title": s.title,
                        "section": s.section,
                        "category": s.category,
                        "confidence": s.confidence,
                    }))
                    .collect::<Vec<_>>()),
            );
        }
        AgentFlavour::Test => {
            object.insert("confidence".into(), json!(outcome.confidence));
            object.insert("sources".into(), json!(outcome.sources));
            object.insert(
                "query_type".into(),
                json!(outcome.classification.query_type.to_string()),
            );
            object.insert(
                "classification_confidence".into(),
                json!(outcome.classification.confidence),
            );
            object.insert("debug_metrics".into(), json!(outcome.metrics));
            object.insert("context_debug".into(), json!(outcome.context_debug));
        }
    }
    body
}

/// POST /api/agent/{flavour}/
pub async fn handle_agent(
    State(state): State<AppState>,
    Path(flavour): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<AgentQueryBody>,
) -> Response {
    let Some(flavour) = AgentFlavour::parse(&flavour) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": "unknown agent flavour"})),
        )
            .into_response();
    };
    let profile = AgentProfile::for_flavour(flavour);

    let user_info = body.user_info.unwrap_or_default();
    let identity = select_identity(
        user_info.agent_id.as_deref(),
        user_info.email.as_deref(),
        &addr.ip().to_string(),
    );

    let decision = state.limiter.check(&identity, profile.rate_class).await;
    if !decision.allowed {
        return rate_limited_response(&decision);
    }

    let request = QueryRequest {
        message: body.message,
        session_id: body.session_id,
        identity,
        audience: profile.audience,
    };

    match state.engine.process(request).await {
        Ok(outcome) => {
            let shaped = shape_response(&profile, &outcome);
            (StatusCode::OK, rate_limit_headers(&decision), Json(shaped)).into_response()
        }
        Err(Error::InvalidInput(detail)) => (
            StatusCode::BAD_REQUEST,
            rate_limit_headers(&decision),
            Json(json!({"error": "validation_error", "message": detail})),
        )
            .into_response(),
        Err(e) => {
            // Never leak upstream exception detail to the client
            tracing::error!(error = %e, "agent query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                rate_limit_headers(&decision),
                Json(json!({"error": "internal_error", "message": "Something went wrong."})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, QueryType};
    use crate::metrics::QueryMetrics;
    use crate::orchestrator::ContextDebug;
    use crate::retrieval::SourceRef;

    fn outcome() -> QueryOutcome {
        QueryOutcome {
            response_text: "Answer.".into(),
            session_id: "s1".into(),
            requires_escalation: false,
            confidence: 0.88,
            sources: vec![SourceRef {
                title: "Upload Photos Guide".into(),
                section: "Steps".into(),
                category: "media".into(),
                confidence: 0.88,
            }],
            classification: Classification {
                query_type: QueryType::Howto,
                confidence: 0.8,
            },
            context_debug: ContextDebug::default(),
            metrics: QueryMetrics::new("s1", "q"),
        }
    }

    #[test]
    fn test_flavour_parse() {
        assert_eq!(AgentFlavour::parse("test"), Some(AgentFlavour::Test));
        assert_eq!(AgentFlavour::parse("support"), Some(AgentFlavour::Support));
        assert_eq!(AgentFlavour::parse("customer"), Some(AgentFlavour::Customer));
        assert_eq!(AgentFlavour::parse("admin"), None);
    }

    #[test]
    fn test_customer_response_is_minimal() {
        let profile = AgentProfile::for_flavour(AgentFlavour::Customer);
        let body = shape_response(&profile, &outcome());
        let object = body.as_object().unwrap();
        assert!(object.contains_key("response"));
        assert!(object.contains_key("requires_escalation"));
        assert!(!object.contains_key("confidence"));
        assert!(!object.contains_key("sources"));
        assert!(!object.contains_key("debug_metrics"));
    }

    #[test]
    fn test_support_response_has_trimmed_sources() {
        let profile = AgentProfile::for_flavour(AgentFlavour::Support);
        let body = shape_response(&profile, &outcome());
        assert_eq!(body["confidence"], 0.88);
        assert_eq!(body["sources"][0]["title"], "Upload Photos Guide");
        assert!(body.get("debug_metrics").is_none());
    }

    #[test]
    fn test_test_response_has_full_telemetry() {
        let profile = AgentProfile::for_flavour(AgentFlavour::Test);
        let body = shape_response(&profile, &outcome());
        assert_eq!(body["query_type"], "howto");
        assert!(body.get("debug_metrics").is_some());
        assert!(body.get("context_debug").is_some());
    }

    #[test]
    fn test_audience_filter_per_flavour() {
        assert_eq!(
            AgentProfile::for_flavour(AgentFlavour::Customer).audience,
            UserType::External
        );
        assert_eq!(
            AgentProfile::for_flavour(AgentFlavour::Support).audience,
            UserType::Internal
        );
    }

    #[test]
    fn test_rate_limit_headers_on_denial() {
        let decision = RateDecision {
            allowed: false,
            limit: 100,
            remaining: 0,
            reset_epoch_s: 1_700_000_000,
            reset_in_seconds: 3600,
        };
        let headers = rate_limit_headers(&decision);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("retry-after").unwrap(), "3600");
    }
}
