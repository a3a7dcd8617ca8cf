//! Token and cost accounting
//!
//! Every LLM-boundary call (query intelligence, embedding, response
//! generation, summarization) records exactly one `TokenUsage` entry. Entries
//! are grouped per query window and folded into per-session totals when the
//! window settles. Cost is frozen into the entry at record time from the
//! price table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::pricing::PriceTable;

/// The LLM boundary a usage entry is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    QueryIntelligence,
    Embedding,
    ResponseGeneration,
    Summarization,
}

/// One recorded LLM call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub operation: Operation,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model_id: String,
    pub cost_usd: f64,
}

/// Per-query cost summary grouped by operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub query_intelligence_cost: f64,
    pub embedding_cost: f64,
    pub response_generation_cost: f64,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl CostBreakdown {
    pub fn from_entries(entries: &[TokenUsage]) -> Self {
        let mut breakdown = Self::default();
        for entry in entries {
            match entry.operation {
                Operation::QueryIntelligence => breakdown.query_intelligence_cost += entry.cost_usd,
                Operation::Embedding => breakdown.embedding_cost += entry.cost_usd,
                // Summarization runs outside the query window; if an entry
                // lands here anyway it still counts toward the total below.
                Operation::ResponseGeneration | Operation::Summarization => {
                    breakdown.response_generation_cost += entry.cost_usd
                }
            }
            breakdown.total_cost += entry.cost_usd;
            breakdown.total_input_tokens += entry.input_tokens as u64;
            breakdown.total_output_tokens += entry.output_tokens as u64;
        }
        breakdown
    }
}

/// Running totals for one session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTotals {
    pub queries: u64,
    pub cost_usd: f64,
}

#[derive(Default)]
struct AccountantInner {
    /// Open query windows, keyed by query id
    windows: HashMap<String, Vec<TokenUsage>>,
    /// Per-session lifetime totals
    sessions: HashMap<String, SessionTotals>,
}

/// Concurrency-safe accountant shared across requests
#[derive(Clone, Default)]
pub struct Accountant {
    inner: Arc<RwLock<AccountantInner>>,
}

impl Accountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a query window. Must be settled with [`Accountant::settle`].
    pub fn open_window(&self, query_id: &str) {
        // Recover from poisoned lock - the data is still valid
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.windows.entry(query_id.to_string()).or_default();
    }

    /// Record a usage entry, computing its cost from the price table now.
    pub fn record(
        &self,
        query_id: &str,
        operation: Operation,
        model_id: &str,
        input_tokens: u32,
        output_tokens: u32,
        prices: &PriceTable,
    ) -> TokenUsage {
        let entry = TokenUsage {
            operation,
            input_tokens,
            output_tokens,
            model_id: model_id.to_string(),
            cost_usd: prices.cost_usd(model_id, input_tokens, output_tokens),
        };
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard
            .windows
            .entry(query_id.to_string())
            .or_default()
            .push(entry.clone());
        entry
    }

    /// Record usage directly against a session, outside any query window.
    /// Used for summarization, which runs after the query finalises.
    pub fn record_session(
        &self,
        session_id: &str,
        operation: Operation,
        model_id: &str,
        input_tokens: u32,
        output_tokens: u32,
        prices: &PriceTable,
    ) -> TokenUsage {
        let entry = TokenUsage {
            operation,
            input_tokens,
            output_tokens,
            model_id: model_id.to_string(),
            cost_usd: prices.cost_usd(model_id, input_tokens, output_tokens),
        };
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let totals = guard.sessions.entry(session_id.to_string()).or_default();
        totals.cost_usd += entry.cost_usd;
        entry
    }

    /// Close a query window: returns its entries and the derived breakdown,
    /// folding cost + query count into the session totals.
    pub fn settle(&self, query_id: &str, session_id: &str) -> (Vec<TokenUsage>, CostBreakdown) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entries = guard.windows.remove(query_id).unwrap_or_default();
        let breakdown = CostBreakdown::from_entries(&entries);
        let totals = guard.sessions.entry(session_id.to_string()).or_default();
        totals.queries += 1;
        totals.cost_usd += breakdown.total_cost;
        (entries, breakdown)
    }

    /// Drain the lifetime totals for a session (called at end_session flush).
    pub fn drain_session(&self, session_id: &str) -> SessionTotals {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.sessions.remove(session_id).unwrap_or_default()
    }

    /// Read current session totals without draining
    pub fn session_totals(&self, session_id: &str) -> SessionTotals {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.sessions.get(session_id).copied().unwrap_or_default()
    }
}
