//! Narrow interfaces over external collaborators
//!
//! The engine never talks to vendor SDKs directly from the pipeline; every
//! external service sits behind one of these traits so deployments can swap
//! backends and tests can script them.

pub mod chat;
pub mod embedding;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kb::{KbChunk, MetadataFilter, ScoredChunk};
use crate::metrics::QueryMetrics;
use crate::session::{EndReason, SessionHeader, StoredMessage};

/// Token usage as reported by a provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Chat-completion request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Ask the provider for a JSON object response
    pub json_output: bool,
}

/// Chat-completion reply
#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub usage: ProviderUsage,
}

/// Chat-completion LLM
#[async_trait]
pub trait Chat: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply>;
}

/// Text → dense vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<(Vec<f32>, ProviderUsage)>;

    /// Model id, part of the embedding-cache key so a model switch
    /// invalidates cached vectors.
    fn model_id(&self) -> &str;
}

/// Vector index over KB chunks
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-k chunks by cosine similarity passing `filter`, all with
    /// similarity >= `threshold`.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        threshold: f64,
    ) -> Result<Vec<ScoredChunk>>;

    /// All chunks of one parent document, ordered by chunk_index
    async fn fetch_siblings(&self, parent_entry_id: &str) -> Result<Vec<KbChunk>>;
}

/// Fast cache tier (list ops, TTL'd values, atomic counters)
#[async_trait]
pub trait Cache: Send + Sync {
    /// Pipelined lpush + ltrim(keep) + expire(ttl) in one round-trip
    async fn push_recent(&self, key: &str, value: String, keep: usize, ttl: Duration) -> Result<()>;

    /// Most recent `n` values, newest first
    async fn recent(&self, key: &str, n: usize) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Atomic increment; the first increment starts the window. Returns the
    /// new count and the window's remaining time.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<(i64, Duration)>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Thumbs feedback on an assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub session_id: String,
    pub rating: FeedbackRating,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    Up,
    Down,
}

/// Recorded agent failure awaiting ticket hand-off or decline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub session_id: String,
    pub query_text: String,
    pub reason: String,
    pub state: FailureState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    Recorded,
    TicketCreated,
    Declined,
}

/// Durable storage tier
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_session(&self, header: &SessionHeader) -> Result<()>;

    async fn session_header(&self, session_id: &str) -> Result<Option<SessionHeader>>;

    /// Append one message; returns the session's new message count
    async fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<u64>;

    /// Most recent `limit` messages, newest first
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;

    async fn mark_ended(&self, session_id: &str, reason: EndReason, at: DateTime<Utc>) -> Result<()>;

    async fn update_identity_aggregates(
        &self,
        identity: &str,
        queries: u64,
        cost_usd: f64,
    ) -> Result<()>;

    /// Batch-persist the per-query metrics buffered during a session
    async fn store_metrics_batch(&self, session_id: &str, records: &[QueryMetrics]) -> Result<()>;

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<()>;

    async fn record_failure(&self, record: &FailureRecord) -> Result<()>;

    async fn get_failure(&self, failure_id: &str) -> Result<Option<FailureRecord>>;

    /// Returns false when no failure with that id exists
    async fn set_failure_state(&self, failure_id: &str, state: FailureState) -> Result<bool>;
}

/// Bound an external call by its timeout budget
pub async fn with_timeout<T, F>(service: &'static str, budget: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            service,
            timeout_ms: budget.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let out = with_timeout("cache", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: Result<()> = with_timeout("llm", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { service: "llm", .. })));
    }
}
