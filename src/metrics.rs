//! Per-query metrics
//!
//! Every finalised query emits exactly one `QueryMetrics` record. Records
//! are buffered per session and flushed to the durable store in one batch
//! when the session ends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::accounting::CostBreakdown;
use crate::classify::QueryType;
use crate::intelligence::Routing;
use crate::kb::MetadataFilter;

/// Why a query was escalated to a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    None,
    NoResults,
    LowConfidence,
    UserRequested,
}

impl Default for EscalationReason {
    fn default() -> Self {
        EscalationReason::None
    }
}

/// One vector-search attempt and how many chunks it returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAttempt {
    pub filter: MetadataFilter,
    pub outcome_count: usize,
}

/// Retrieval-phase execution detail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchExecution {
    pub filters_applied: usize,
    pub attempts: Vec<SearchAttempt>,
    /// Cumulative chunks surfaced across all attempts
    pub documents_scanned: usize,
    pub documents_matched: usize,
    pub documents_returned: usize,
    pub similarity_threshold: f64,
    pub embedding_time_ms: u64,
    pub search_time_ms: u64,
    pub rerank_time_ms: u64,
}

/// The unit operational record, one per query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_text: String,
    pub session_id: String,
    pub classified_type: QueryType,
    pub classification_confidence: f64,
    pub enhanced_query: String,
    pub routing: Routing,
    pub search_execution: SearchExecution,
    pub sources_found: usize,
    pub sources_used: usize,
    pub best_confidence: f64,
    pub total_time_ms: u64,
    pub classification_time_ms: u64,
    pub query_intelligence_time_ms: u64,
    pub response_generation_time_ms: u64,
    pub cost_breakdown: CostBreakdown,
    pub escalated: bool,
    pub escalation_reason: EscalationReason,
    /// Both storage tiers were unavailable; query ran with empty context
    #[serde(default)]
    pub session_degraded: bool,
    /// Query-intelligence output failed validation and the fallback verdict ran
    #[serde(default)]
    pub query_intelligence_fallback: bool,
    /// An internal invariant was violated but the request still completed
    #[serde(default)]
    pub invariant_violation: bool,
}

impl QueryMetrics {
    pub fn new(session_id: &str, query_text: &str) -> Self {
        Self {
            query_text: query_text.to_string(),
            session_id: session_id.to_string(),
            classified_type: QueryType::General,
            classification_confidence: 0.0,
            enhanced_query: String::new(),
            routing: Routing::FullRag,
            search_execution: SearchExecution::default(),
            sources_found: 0,
            sources_used: 0,
            best_confidence: 0.0,
            total_time_ms: 0,
            classification_time_ms: 0,
            query_intelligence_time_ms: 0,
            response_generation_time_ms: 0,
            cost_breakdown: CostBreakdown::default(),
            escalated: false,
            escalation_reason: EscalationReason::None,
            session_degraded: false,
            query_intelligence_fallback: false,
            invariant_violation: false,
        }
    }
}

/// Wall-clock stopwatch for phase timing
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

/// Buffers finalised records per session until the end-of-session flush
#[derive(Clone, Default)]
pub struct MetricsSink {
    buffered: Arc<RwLock<HashMap<String, Vec<QueryMetrics>>>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a finalised record: log the headline fields and buffer the rest.
    pub fn emit(&self, record: QueryMetrics) {
        tracing::info!(
            session_id = %record.session_id,
            query_type = %record.classified_type,
            routing = ?record.routing,
            sources_found = record.sources_found,
            best_confidence = record.best_confidence,
            total_time_ms = record.total_time_ms,
            cost_usd = record.cost_breakdown.total_cost,
            escalated = record.escalated,
            "query finalised"
        );
        // Recover from poisoned lock - the data is still valid
        let mut guard = self.buffered.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
    }

    /// Drain all records buffered for a session
    pub fn flush_session(&self, session_id: &str) -> Vec<QueryMetrics> {
        let mut guard = self.buffered.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(session_id).unwrap_or_default()
    }

    /// Number of buffered records for a session (test hook)
    pub fn buffered_count(&self, session_id: &str) -> usize {
        let guard = self.buffered.read().unwrap_or_else(|e| e.into_inner());
        guard.get(session_id).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_buffers_per_session() {
        let sink = MetricsSink::new();
        sink.emit(QueryMetrics::new("s1", "q"));
        sink.emit(QueryMetrics::new("s1", "q2"));
        sink.emit(QueryMetrics::new("s2", "q3"));

        assert_eq!(sink.buffered_count("s1"), 2);
        let drained = sink.flush_session("s1");
        assert_eq!(drained.len(), 2);
        assert_eq!(sink.buffered_count("s1"), 0);
        assert_eq!(sink.buffered_count("s2"), 1);
    }

    #[test]
    fn test_new_record_zeroed() {
        let record = QueryMetrics::new("s1", "how do I upload photos");
        assert_eq!(record.search_execution.embedding_time_ms, 0);
        assert_eq!(record.sources_found, 0);
        assert_eq!(record.escalation_reason, EscalationReason::None);
        assert!(!record.escalated);
    }
}
