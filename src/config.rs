//! Engine configuration
//!
//! All knobs are loaded from environment variables with safe defaults and
//! minimum clamps so a bad value can never disable a limit entirely.

use std::time::Duration;

/// Rate-limit window definition for one endpoint class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindow {
    /// Maximum allowed requests per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
}

/// Per-class rate limits
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub query: RateWindow,
    pub feedback: RateWindow,
    pub ticket: RateWindow,
    pub default: RateWindow,
    /// Deny requests when the counter backend is unreachable.
    /// Flipping this to fail-open must be an explicit operator decision.
    pub fail_closed: bool,
}

impl Default for RateLimits {
    fn default() -> Self {
        const DAY: Duration = Duration::from_secs(24 * 60 * 60);
        Self {
            query: RateWindow { limit: 100, window: DAY },
            feedback: RateWindow { limit: 50, window: DAY },
            ticket: RateWindow { limit: 10, window: DAY },
            default: RateWindow { limit: 100, window: Duration::from_secs(300) },
            fail_closed: true,
        }
    }
}

impl RateLimits {
    /// Load rate limits from environment variables with safe defaults
    ///
    /// Environment variables:
    /// - RATE_LIMIT_QUERY_DAILY (default: 100, min: 1)
    /// - RATE_LIMIT_FEEDBACK_DAILY (default: 50, min: 1)
    /// - RATE_LIMIT_TICKET_DAILY (default: 10, min: 1)
    /// - RATE_LIMIT_FAIL_CLOSED (default: true)
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        limits.query.limit = parse_env_u32("RATE_LIMIT_QUERY_DAILY", 100, 1);
        limits.feedback.limit = parse_env_u32("RATE_LIMIT_FEEDBACK_DAILY", 50, 1);
        limits.ticket.limit = parse_env_u32("RATE_LIMIT_TICKET_DAILY", 10, 1);
        limits.fail_closed = std::env::var("RATE_LIMIT_FAIL_CLOSED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        limits
    }
}

/// Timeouts for each external collaborator plus the overall request deadline
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub cache: Duration,
    pub durable: Duration,
    pub embedding: Duration,
    pub vector_search: Duration,
    pub llm: Duration,
    pub deadline: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cache: Duration::from_secs(1),
            durable: Duration::from_secs(5),
            embedding: Duration::from_secs(10),
            vector_search: Duration::from_secs(10),
            llm: Duration::from_secs(30),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum similarity for a retrieval attempt to count as a hit
    pub similarity_threshold: f64,
    /// Grounded answers below this confidence set `low_confidence` escalation
    pub low_confidence_escalation_threshold: f64,
    /// Messages presented verbatim to the LLM (most recent first)
    pub context_messages: usize,
    /// Messages retained in the cache tier per session
    pub cache_recent_messages: usize,
    /// Regenerate the rolling summary every N messages
    pub summary_interval: usize,
    /// Cache-tier TTL; doubles as the session inactivity bound
    pub session_ttl: Duration,
    /// Sessions end after this many messages
    pub session_message_cap: usize,
    /// Top-k chunks returned from retrieval
    pub retrieval_top_k: usize,
    /// Upper bound on chunks after parent expansion
    pub expansion_max_chunks: usize,
    /// Embedding cache capacity (entries) and TTL
    pub embedding_cache_capacity: u64,
    pub embedding_cache_ttl: Duration,
    /// Model ids
    pub chat_model: String,
    pub summary_model: String,
    pub embedding_model: String,
    /// Phrases that mean the user wants a human
    pub escalation_phrases: Vec<String>,
    pub rate_limits: RateLimits,
    pub timeouts: Timeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            low_confidence_escalation_threshold: 0.50,
            context_messages: 5,
            cache_recent_messages: 8,
            summary_interval: 5,
            session_ttl: Duration::from_secs(7200),
            session_message_cap: 200,
            retrieval_top_k: 5,
            expansion_max_chunks: 12,
            embedding_cache_capacity: 1024,
            embedding_cache_ttl: Duration::from_secs(300),
            chat_model: "claude-3-5-haiku".to_string(),
            summary_model: "claude-3-5-haiku".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            escalation_phrases: default_escalation_phrases(),
            rate_limits: RateLimits::default(),
            timeouts: Timeouts::default(),
        }
    }
}

fn default_escalation_phrases() -> Vec<String> {
    [
        "raise a ticket",
        "create a ticket",
        "open a ticket",
        "talk to support",
        "speak to support",
        "talk to a human",
        "speak to a human",
        "talk to someone",
        "contact support",
        "real person",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl EngineConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = parse_env_f64("SIMILARITY_THRESHOLD") {
            config.similarity_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = parse_env_f64("LOW_CONFIDENCE_THRESHOLD") {
            config.low_confidence_escalation_threshold = v.clamp(0.0, 1.0);
        }
        config.session_ttl = Duration::from_secs(
            parse_env_u64("SESSION_TTL_SECONDS", 7200, 60),
        );
        config.timeouts.deadline = Duration::from_millis(
            parse_env_u64("ORCHESTRATOR_DEADLINE_MS", 60_000, 1_000),
        );
        if let Ok(model) = std::env::var("CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Ok(model) = std::env::var("SUMMARY_MODEL") {
            config.summary_model = model;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(phrases) = std::env::var("ESCALATION_PHRASES") {
            let parsed: Vec<String> = phrases
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.escalation_phrases = parsed;
            }
        }
        config.rate_limits = RateLimits::from_env();

        config
    }
}

fn parse_env_u32(key: &str, default: u32, min: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
        .max(min)
}

fn parse_env_u64(key: &str, default: u64, min: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
        .max(min)
}

fn parse_env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limits_default() {
        let limits = RateLimits::default();
        assert_eq!(limits.query.limit, 100);
        assert_eq!(limits.feedback.limit, 50);
        assert_eq!(limits.ticket.limit, 10);
        assert!(limits.fail_closed);
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.similarity_threshold, 0.70);
        assert_eq!(config.low_confidence_escalation_threshold, 0.50);
        assert_eq!(config.context_messages, 5);
        assert_eq!(config.cache_recent_messages, 8);
        assert_eq!(config.summary_interval, 5);
        assert_eq!(config.session_ttl, Duration::from_secs(7200));
    }

    #[test]
    fn test_escalation_phrases_present() {
        let config = EngineConfig::default();
        assert!(config
            .escalation_phrases
            .iter()
            .any(|p| p == "raise a ticket"));
    }
}
