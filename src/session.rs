//! Two-tier session store
//!
//! The cache tier keeps the last 8 messages and the rolling summary per
//! session under a 2h TTL; the durable tier keeps the full append-only log
//! plus the session header. Appends to the same session are serialised by a
//! per-session lock held by the orchestrator across the user/assistant pair.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::accounting::{Accountant, CostBreakdown, Operation};
use crate::clients::{with_timeout, Cache, Chat, ChatRequest, DurableStore};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pricing::{estimate_tokens, PriceTable};

/// Maximum messages preserved in the in-process fallback buffer per session
const FALLBACK_RING_CAPACITY: usize = 20;

/// Durable-append retry schedule (bounded exponential backoff)
const APPEND_RETRY_DELAYS_MS: [u64; 3] = [50, 100, 200];

const SUMMARY_MAX_TOKENS: u32 = 600;
const SUMMARY_TEMPERATURE: f32 = 0.3;

/// System prompt for rolling-summary generation
const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer for a support assistant. \
Produce a concise summary that preserves: what the user is trying to do, \
which knowledge-base articles were referenced, answers already given, and \
any unresolved questions. Use short bullet points. Keep under 400 tokens. \
Do not include pleasantries or meta-commentary.";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Metadata recorded on assistant messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// KB source titles the answer drew on
    #[serde(default)]
    pub sources: Vec<String>,
    /// Related-document titles carried by the cited chunks; lets a later
    /// follow-up route a targeted search at one of them
    #[serde(default)]
    pub related: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub cost: CostBreakdown,
}

/// One message in a session log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Some(metadata),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ClientRequested,
    Inactivity,
    Escalated,
    MessageCap,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ClientRequested => "client_requested",
            EndReason::Inactivity => "inactivity",
            EndReason::Escalated => "escalated",
            EndReason::MessageCap => "message_cap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_requested" => Some(EndReason::ClientRequested),
            "inactivity" => Some(EndReason::Inactivity),
            "escalated" => Some(EndReason::Escalated),
            "message_cap" => Some(EndReason::MessageCap),
            _ => None,
        }
    }
}

/// Durable-tier session header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub message_count: u64,
}

impl SessionHeader {
    pub fn new(session_id: &str, identity: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            identity: identity.to_string(),
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            end_reason: None,
            message_count: 0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// LLM-maintained condensation of older messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingSummary {
    pub text: String,
    pub covers_through_message_index: u64,
}

/// Conversation context handed to the orchestrator
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Most recent messages, oldest first, capped at `context_messages`
    pub recent: Vec<StoredMessage>,
    pub summary: Option<RollingSummary>,
    /// Both tiers were unavailable; the query proceeds with empty context
    pub degraded: bool,
}

lazy_static! {
    static ref APOLOGY: Regex = Regex::new(
        r"(?i)\b(sorry|apolog|couldn'?t\s+find|unable\s+to|no\s+information|something\s+went\s+wrong)\b"
    )
    .unwrap();
}

impl SessionContext {
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.summary.is_none()
    }

    /// True when every assistant message in the window is an error/apology.
    /// Such context cannot support `answer_from_context` routing.
    pub fn looks_error_only(&self) -> bool {
        let mut saw_assistant = false;
        for message in &self.recent {
            if message.role == Role::Assistant {
                saw_assistant = true;
                if !APOLOGY.is_match(&message.content) {
                    return false;
                }
            }
        }
        saw_assistant
    }

    /// KB source titles cited by prior assistant turns (including their
    /// related documents), oldest first, deduped
    pub fn prior_source_titles(&self) -> Vec<String> {
        let mut titles = Vec::new();
        for message in &self.recent {
            if let Some(metadata) = &message.metadata {
                for title in metadata.sources.iter().chain(metadata.related.iter()) {
                    if !titles.contains(title) {
                        titles.push(title.clone());
                    }
                }
            }
        }
        titles
    }

    /// Single string presented to LLMs: summary first, then the last K
    /// messages with role prefixes; assistant turns carry a source line.
    pub fn formatted(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.summary {
            out.push_str("Previous conversation summary:\n");
            out.push_str(&summary.text);
            out.push_str("\n\n");
        }
        for message in &self.recent {
            out.push_str(message.role.label());
            out.push_str(": ");
            out.push_str(&message.content);
            out.push('\n');
            if message.role == Role::Assistant {
                if let Some(metadata) = &message.metadata {
                    if !metadata.sources.is_empty() {
                        out.push_str("[Sources: ");
                        out.push_str(&metadata.sources.join(", "));
                        out.push_str("]\n");
                    }
                }
            }
        }
        out
    }
}

// ============================================================================
// Per-session locks
// ============================================================================

/// Sharded map of session id → lock. Entries are dropped opportunistically
/// once no request holds or waits on them.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            // Recover from poisoned lock - the data is still valid
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            guard.retain(|_, lock| Arc::strong_count(lock) > 1);
            guard
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Two-tier session store
pub struct SessionStore {
    cache: Arc<dyn Cache>,
    durable: Arc<dyn DurableStore>,
    locks: SessionLocks,
    /// Messages that definitively failed the durable append, re-flushed
    /// opportunistically on later appends
    fallback_ring: RwLock<HashMap<String, VecDeque<(String, StoredMessage)>>>,
    cache_recent_messages: usize,
    context_messages: usize,
    summary_interval: usize,
    session_ttl: Duration,
    cache_timeout: Duration,
    durable_timeout: Duration,
    llm_timeout: Duration,
}

fn messages_key(session_id: &str) -> String {
    format!("session:{session_id}:messages")
}

fn summary_key(session_id: &str) -> String {
    format!("session:{session_id}:summary")
}

impl SessionStore {
    pub fn new(cache: Arc<dyn Cache>, durable: Arc<dyn DurableStore>, config: &EngineConfig) -> Self {
        Self {
            cache,
            durable,
            locks: SessionLocks::new(),
            fallback_ring: RwLock::new(HashMap::new()),
            cache_recent_messages: config.cache_recent_messages,
            context_messages: config.context_messages,
            summary_interval: config.summary_interval,
            session_ttl: config.session_ttl,
            cache_timeout: config.timeouts.cache,
            durable_timeout: config.timeouts.durable,
            llm_timeout: config.timeouts.llm,
        }
    }

    /// Serialise appends for one session. Held by the orchestrator from the
    /// user append through the assistant append.
    pub async fn lock_session(&self, session_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.acquire(session_id).await
    }

    pub async fn session_header(&self, session_id: &str) -> Result<Option<SessionHeader>> {
        with_timeout(
            "durable",
            self.durable_timeout,
            self.durable.session_header(session_id),
        )
        .await
    }

    pub async fn create_session(&self, header: &SessionHeader) -> Result<()> {
        with_timeout(
            "durable",
            self.durable_timeout,
            self.durable.create_session(header),
        )
        .await
    }

    /// Append one message: cache push (single pipelined round-trip) plus
    /// durable append with bounded retry. Returns the durable message count
    /// when known.
    pub async fn append(&self, session_id: &str, message: &StoredMessage) -> Result<Option<u64>> {
        let serialized = serde_json::to_string(message)?;

        let cache_write = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache.push_recent(
                &messages_key(session_id),
                serialized,
                self.cache_recent_messages,
                self.session_ttl,
            ),
        )
        .await;
        if let Err(e) = cache_write {
            tracing::warn!(session_id, error = %e, "cache append failed; durable tier still authoritative");
        }

        // Re-flush anything stranded by an earlier durable outage first so
        // the log keeps its order.
        self.flush_fallback(session_id).await;

        match self.durable_append_with_retry(session_id, message).await {
            Ok(count) => Ok(Some(count)),
            Err(e) => {
                tracing::error!(session_id, error = %e, "durable append failed after retries; buffering");
                self.buffer_fallback(session_id, message.clone());
                Ok(None)
            }
        }
    }

    async fn durable_append_with_retry(
        &self,
        session_id: &str,
        message: &StoredMessage,
    ) -> Result<u64> {
        let mut last_err = None;
        for (attempt, delay_ms) in std::iter::once(&0u64)
            .chain(APPEND_RETRY_DELAYS_MS.iter())
            .enumerate()
        {
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            match with_timeout(
                "durable",
                self.durable_timeout,
                self.durable.append_message(session_id, message),
            )
            .await
            {
                Ok(count) => return Ok(count),
                Err(e) => {
                    tracing::warn!(session_id, attempt, error = %e, "durable append attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| crate::error::Error::Other("append failed".into())))
    }

    fn buffer_fallback(&self, session_id: &str, message: StoredMessage) {
        let mut guard = self.fallback_ring.write().unwrap_or_else(|e| e.into_inner());
        let ring = guard.entry(session_id.to_string()).or_default();
        if ring.len() >= FALLBACK_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back((session_id.to_string(), message));
    }

    /// Drain buffered messages back into the durable tier, stopping at the
    /// first failure to preserve ordering.
    async fn flush_fallback(&self, session_id: &str) {
        loop {
            let next = {
                let mut guard = self.fallback_ring.write().unwrap_or_else(|e| e.into_inner());
                match guard.get_mut(session_id) {
                    Some(ring) => ring.pop_front(),
                    None => None,
                }
            };
            let Some((sid, message)) = next else { break };
            let result = with_timeout(
                "durable",
                self.durable_timeout,
                self.durable.append_message(&sid, &message),
            )
            .await;
            if result.is_err() {
                // Put it back at the head and stop; order must hold.
                let mut guard = self.fallback_ring.write().unwrap_or_else(|e| e.into_inner());
                guard
                    .entry(session_id.to_string())
                    .or_default()
                    .push_front((sid, message));
                break;
            }
        }
    }

    /// Read conversation context: cache first, durable on miss, empty +
    /// degraded when both tiers are out.
    pub async fn read_context(&self, session_id: &str) -> SessionContext {
        let summary = self.read_summary(session_id).await;

        let cached = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache
                .recent(&messages_key(session_id), self.cache_recent_messages),
        )
        .await;

        let raw: Option<Vec<StoredMessage>> = match cached {
            Ok(values) if !values.is_empty() => {
                let mut parsed: Vec<StoredMessage> = values
                    .iter()
                    .filter_map(|v| serde_json::from_str(v).ok())
                    .collect();
                // Cache returns newest first; context wants oldest first.
                parsed.reverse();
                Some(parsed)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "cache read failed; falling through to durable");
                None
            }
        };

        let messages = match raw {
            Some(messages) => Some(messages),
            None => {
                match with_timeout(
                    "durable",
                    self.durable_timeout,
                    self.durable
                        .recent_messages(session_id, self.cache_recent_messages),
                )
                .await
                {
                    Ok(mut messages) => {
                        messages.reverse();
                        // Repopulate the cache tier for the next read.
                        for message in &messages {
                            if let Ok(serialized) = serde_json::to_string(message) {
                                let _ = with_timeout(
                                    "cache",
                                    self.cache_timeout,
                                    self.cache.push_recent(
                                        &messages_key(session_id),
                                        serialized,
                                        self.cache_recent_messages,
                                        self.session_ttl,
                                    ),
                                )
                                .await;
                            }
                        }
                        Some(messages)
                    }
                    Err(e) => {
                        tracing::error!(session_id, error = %e, "both session tiers unavailable");
                        None
                    }
                }
            }
        };

        match messages {
            Some(mut recent) => {
                let keep_from = recent.len().saturating_sub(self.context_messages);
                recent.drain(..keep_from);
                SessionContext {
                    recent,
                    summary,
                    degraded: false,
                }
            }
            None => SessionContext {
                recent: Vec::new(),
                summary,
                degraded: true,
            },
        }
    }

    async fn read_summary(&self, session_id: &str) -> Option<RollingSummary> {
        let value = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache.get(&summary_key(session_id)),
        )
        .await
        .ok()
        .flatten()?;
        serde_json::from_str(&value).ok()
    }

    /// Regenerate the rolling summary when the message count crosses the
    /// interval. Failures keep the previous summary and are never surfaced.
    pub async fn maybe_summarize(
        &self,
        chat: &dyn Chat,
        accountant: &Accountant,
        prices: &PriceTable,
        summary_model: &str,
        session_id: &str,
        message_count: u64,
    ) {
        if message_count == 0 || message_count % self.summary_interval as u64 != 0 {
            return;
        }

        let previous = self.read_summary(session_id).await;
        let delta = match with_timeout(
            "durable",
            self.durable_timeout,
            self.durable
                .recent_messages(session_id, self.summary_interval),
        )
        .await
        {
            Ok(mut messages) => {
                messages.reverse();
                messages
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "summary skipped; could not read messages");
                return;
            }
        };
        if delta.is_empty() {
            return;
        }

        let mut content = String::new();
        if let Some(summary) = &previous {
            content.push_str("=== PREVIOUS SUMMARY ===\n");
            content.push_str(&summary.text);
            content.push_str("\n\n=== NEW MESSAGES TO INCORPORATE ===\n");
        }
        for message in &delta {
            content.push_str(&format!("{}: {}\n\n", message.role.label(), message.content));
        }

        let request = ChatRequest {
            model: summary_model.to_string(),
            prompt: content.clone(),
            max_tokens: SUMMARY_MAX_TOKENS,
            temperature: SUMMARY_TEMPERATURE,
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            json_output: false,
        };

        match with_timeout("llm", self.llm_timeout, chat.complete(request)).await {
            Ok(reply) => {
                accountant.record_session(
                    session_id,
                    Operation::Summarization,
                    summary_model,
                    reply.usage.input_tokens,
                    reply.usage.output_tokens,
                    prices,
                );
                let summary = RollingSummary {
                    text: reply.content,
                    covers_through_message_index: message_count,
                };
                if let Ok(serialized) = serde_json::to_string(&summary) {
                    let _ = with_timeout(
                        "cache",
                        self.cache_timeout,
                        self.cache
                            .set_with_ttl(&summary_key(session_id), serialized, self.session_ttl),
                    )
                    .await;
                }
            }
            Err(e) => {
                // Estimate-only usage entry so the call is still accounted.
                accountant.record_session(
                    session_id,
                    Operation::Summarization,
                    summary_model,
                    estimate_tokens(&content),
                    0,
                    prices,
                );
                tracing::warn!(session_id, error = %e, "summary generation failed; keeping previous");
            }
        }
    }

    /// Mark a session ended and clear its cache keys. The metrics/aggregate
    /// flush is driven by the orchestrator, which owns those components.
    pub async fn end_session(&self, session_id: &str, reason: EndReason) -> Result<()> {
        with_timeout(
            "durable",
            self.durable_timeout,
            self.durable.mark_ended(session_id, reason, Utc::now()),
        )
        .await?;
        let _ = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache.delete(&messages_key(session_id)),
        )
        .await;
        let _ = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache.delete(&summary_key(session_id)),
        )
        .await;
        Ok(())
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{MemoryCache, MemoryDurableStore};

    fn store() -> SessionStore {
        let config = EngineConfig::default();
        SessionStore::new(
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryDurableStore::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_append_then_read_includes_message() {
        let store = store();
        let header = SessionHeader::new("s1", "user@example.com");
        store.create_session(&header).await.unwrap();

        let count = store
            .append("s1", &StoredMessage::user("how do I upload photos"))
            .await
            .unwrap();
        assert_eq!(count, Some(1));

        let context = store.read_context("s1").await;
        assert_eq!(context.recent.len(), 1);
        assert_eq!(context.recent[0].content, "how do I upload photos");
        assert!(!context.degraded);
    }

    #[tokio::test]
    async fn test_context_caps_at_five_messages() {
        let store = store();
        store
            .create_session(&SessionHeader::new("s1", "i"))
            .await
            .unwrap();
        for i in 0..8 {
            store
                .append("s1", &StoredMessage::user(format!("message {i}")))
                .await
                .unwrap();
        }
        let context = store.read_context("s1").await;
        assert_eq!(context.recent.len(), 5);
        // Oldest-first ordering with the newest message last
        assert_eq!(context.recent.last().unwrap().content, "message 7");
        assert_eq!(context.recent[0].content, "message 3");
    }

    #[tokio::test]
    async fn test_read_falls_through_to_durable_on_cold_cache() {
        let config = EngineConfig::default();
        let cache = Arc::new(MemoryCache::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let store = SessionStore::new(cache.clone(), durable.clone(), &config);
        store
            .create_session(&SessionHeader::new("s1", "i"))
            .await
            .unwrap();
        store
            .append("s1", &StoredMessage::user("hello there"))
            .await
            .unwrap();

        // Simulate cache eviction
        cache.clear();

        let context = store.read_context("s1").await;
        assert_eq!(context.recent.len(), 1);
        assert!(!context.degraded);
    }

    #[tokio::test]
    async fn test_prior_source_titles_and_error_only() {
        let mut context = SessionContext::default();
        context.recent.push(StoredMessage::user("q"));
        context.recent.push(StoredMessage::assistant(
            "See the guide",
            MessageMetadata {
                sources: vec!["Upload Photos Guide".into()],
                related: vec!["How to resize images".into()],
                confidence: 0.9,
                cost: CostBreakdown::default(),
            },
        ));
        assert_eq!(
            context.prior_source_titles(),
            vec!["Upload Photos Guide", "How to resize images"]
        );
        assert!(!context.looks_error_only());

        let mut apologetic = SessionContext::default();
        apologetic.recent.push(StoredMessage::assistant(
            "Sorry, I couldn't find anything about that.",
            MessageMetadata::default(),
        ));
        assert!(apologetic.looks_error_only());
    }

    #[tokio::test]
    async fn test_formatted_context_shape() {
        let mut context = SessionContext::default();
        context.summary = Some(RollingSummary {
            text: "- user is uploading photos".into(),
            covers_through_message_index: 5,
        });
        context.recent.push(StoredMessage::user("what size limit?"));
        let formatted = context.formatted();
        assert!(formatted.starts_with("Previous conversation summary:"));
        assert!(formatted.contains("User: what size limit?"));
    }

    #[tokio::test]
    async fn test_session_locks_cleanup() {
        let locks = SessionLocks::new();
        {
            let _guard = locks.acquire("s1").await;
            assert_eq!(locks.len(), 1);
        }
        // The next acquire retains only live entries before inserting
        let _guard = locks.acquire("s2").await;
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_blocks_reads_of_cache() {
        let store = store();
        store
            .create_session(&SessionHeader::new("s1", "i"))
            .await
            .unwrap();
        store
            .append("s1", &StoredMessage::user("hello"))
            .await
            .unwrap();
        store
            .end_session("s1", EndReason::ClientRequested)
            .await
            .unwrap();
        let header = store.session_header("s1").await.unwrap().unwrap();
        assert!(header.is_ended());
        assert_eq!(header.end_reason, Some(EndReason::ClientRequested));
    }
}
