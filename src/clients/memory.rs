//! In-process collaborator implementations
//!
//! Back the cache tier, durable tier, and vector index with process memory.
//! Used by the test suite and by single-process deployments that run
//! without a cache server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::{Cache, DurableStore, FailureRecord, FailureState, FeedbackRecord};
use crate::error::{Error, Result};
use crate::kb::{KbChunk, MetadataFilter, ScoredChunk};
use crate::metrics::QueryMetrics;
use crate::session::{EndReason, SessionHeader, StoredMessage};

// ============================================================================
// Cache
// ============================================================================

struct ListEntry {
    values: VecDeque<String>,
    expires_at: Instant,
}

struct StringEntry {
    value: String,
    expires_at: Instant,
}

struct CounterEntry {
    count: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    lists: HashMap<String, ListEntry>,
    strings: HashMap<String, StringEntry>,
    counters: HashMap<String, CounterEntry>,
}

/// TTL-aware in-process cache
#[derive(Default)]
pub struct MemoryCache {
    inner: RwLock<CacheInner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all entries (test hook simulating eviction)
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.lists.clear();
        guard.strings.clear();
        guard.counters.clear();
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn push_recent(&self, key: &str, value: String, keep: usize, ttl: Duration) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = guard.lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            values: VecDeque::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.values.clear();
        }
        entry.values.push_front(value);
        entry.values.truncate(keep);
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn recent(&self, key: &str, n: usize) -> Result<Vec<String>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        Ok(guard
            .lists
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.values.iter().take(n).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        Ok(guard
            .strings
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<(i64, Duration)> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = guard.counters.entry(key.to_string()).or_insert_with(|| CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok((entry.count, entry.expires_at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.lists.remove(key);
        guard.strings.remove(key);
        guard.counters.remove(key);
        Ok(())
    }
}

// ============================================================================
// Durable store
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAggregate {
    pub total_queries: u64,
    pub total_cost_usd: f64,
}

#[derive(Default)]
struct DurableInner {
    sessions: HashMap<String, SessionHeader>,
    logs: HashMap<String, Vec<StoredMessage>>,
    aggregates: HashMap<String, IdentityAggregate>,
    metrics: HashMap<String, Vec<QueryMetrics>>,
    feedback: Vec<FeedbackRecord>,
    failures: HashMap<String, FailureRecord>,
}

/// Hash-map-backed durable tier
#[derive(Default)]
pub struct MemoryDurableStore {
    inner: RwLock<DurableInner>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full ordered log for a session (test hook)
    pub fn full_log(&self, session_id: &str) -> Vec<StoredMessage> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.logs.get(session_id).cloned().unwrap_or_default()
    }

    pub fn identity_aggregate(&self, identity: &str) -> IdentityAggregate {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.aggregates.get(identity).copied().unwrap_or_default()
    }

    pub fn stored_metrics(&self, session_id: &str) -> Vec<QueryMetrics> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.metrics.get(session_id).cloned().unwrap_or_default()
    }

    pub fn feedback_count(&self) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.feedback.len()
    }

    pub fn failure(&self, failure_id: &str) -> Option<FailureRecord> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.failures.get(failure_id).cloned()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn create_session(&self, header: &SessionHeader) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard
            .sessions
            .insert(header.session_id.clone(), header.clone());
        guard.logs.entry(header.session_id.clone()).or_default();
        Ok(())
    }

    async fn session_header(&self, session_id: &str) -> Result<Option<SessionHeader>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.sessions.get(session_id).cloned())
    }

    async fn append_message(&self, session_id: &str, message: &StoredMessage) -> Result<u64> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let header = guard
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Database(format!("unknown session {session_id}")))?;
        if header.is_ended() {
            return Err(Error::SessionEnded(session_id.to_string()));
        }
        header.message_count += 1;
        header.last_activity_at = message.timestamp;
        let count = header.message_count;
        guard
            .logs
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(count)
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let log = guard.logs.get(session_id).cloned().unwrap_or_default();
        // Newest first, like the cache tier
        Ok(log.into_iter().rev().take(limit).collect())
    }

    async fn mark_ended(&self, session_id: &str, reason: EndReason, at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(header) = guard.sessions.get_mut(session_id) {
            header.ended_at = Some(at);
            header.end_reason = Some(reason);
        }
        Ok(())
    }

    async fn update_identity_aggregates(
        &self,
        identity: &str,
        queries: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let aggregate = guard.aggregates.entry(identity.to_string()).or_default();
        aggregate.total_queries += queries;
        aggregate.total_cost_usd += cost_usd;
        Ok(())
    }

    async fn store_metrics_batch(&self, session_id: &str, records: &[QueryMetrics]) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard
            .metrics
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.feedback.push(record.clone());
        Ok(())
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.failures.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_failure(&self, failure_id: &str) -> Result<Option<FailureRecord>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.failures.get(failure_id).cloned())
    }

    async fn set_failure_state(&self, failure_id: &str, state: FailureState) -> Result<bool> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match guard.failures.get_mut(failure_id) {
            Some(record) => {
                record.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// Vector index
// ============================================================================

/// Brute-force cosine-similarity index over seeded chunks
#[derive(Default)]
pub struct MemoryVectorIndex {
    chunks: RwLock<Vec<(KbChunk, Vec<f32>)>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chunk: KbChunk, vector: Vec<f32>) {
        let mut guard = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        guard.push((chunk, vector));
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl super::VectorIndex for MemoryVectorIndex {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        threshold: f64,
    ) -> Result<Vec<ScoredChunk>> {
        let guard = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScoredChunk> = guard
            .iter()
            .filter(|(chunk, _)| filter.matches(chunk))
            .map(|(chunk, embedding)| ScoredChunk {
                chunk: chunk.clone(),
                similarity: cosine_similarity(vector, embedding),
            })
            .filter(|scored| scored.similarity >= threshold)
            .collect();
        // Deterministic ordering: similarity desc, then chunk_index asc,
        // then parent id.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
                .then(a.chunk.parent_entry_id.cmp(&b.chunk.parent_entry_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn fetch_siblings(&self, parent_entry_id: &str) -> Result<Vec<KbChunk>> {
        let guard = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        let mut siblings: Vec<KbChunk> = guard
            .iter()
            .filter(|(chunk, _)| chunk.parent_entry_id == parent_entry_id)
            .map(|(chunk, _)| chunk.clone())
            .collect();
        siblings.sort_by_key(|chunk| chunk.chunk_index);
        Ok(siblings)
    }
}
