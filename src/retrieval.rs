//! Retrieval pipeline
//!
//! embed(enhanced query) → progressive-fallback filtered vector search →
//! optional parent-document expansion → dedup + top-k selection.
//!
//! The fallback ladder is data: an ordered list of filters tried until one
//! returns at least one chunk above the similarity threshold. Every attempt
//! is recorded with its outcome count so coverage is enumerable in tests.

use lazy_static::lazy_static;
use moka::sync::Cache as MokaCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::classify::QueryType;
use crate::clients::{with_timeout, Embedder, ProviderUsage, VectorIndex};
use crate::config::EngineConfig;
use crate::kb::{EntryType, KbChunk, MetadataFilter, ScoredChunk, UserType};
use crate::metrics::{SearchAttempt, Stopwatch};
use crate::pricing::estimate_tokens;

/// A source surfaced to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub section: String,
    pub category: String,
    pub confidence: f64,
}

/// Everything the orchestrator needs from one retrieval run
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    /// Chunks (or expanded parents) in final rank order
    pub chunks: Vec<ScoredChunk>,
    pub sources: Vec<SourceRef>,
    /// Related-document titles carried by the selected chunks
    pub related_titles: Vec<String>,
    pub attempts: Vec<SearchAttempt>,
    /// Raw match count from the winning attempt, before dedup/expansion
    pub documents_matched: usize,
    pub best_confidence: f64,
    pub embedding_time_ms: u64,
    pub search_time_ms: u64,
    /// Usage for the embedding call; zeroed on a cache hit
    pub embedding_usage: ProviderUsage,
    pub embedding_cache_hit: bool,
}

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref HOW_MARKERS: Regex =
        Regex::new(r"(?i)\b(how\s+(do|to|can)|steps?\b|guide\b|walk\s+me\s+through)").unwrap();
}

/// Canonical form used for embedding-cache keys
fn normalise_query(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}

/// Build the ordered filter ladder for one query.
///
/// Consecutive duplicates (e.g. when the verdict carried no category) are
/// collapsed so every attempt in the output is distinct.
pub fn fallback_ladder(
    classified: QueryType,
    category: Option<&str>,
    audience: UserType,
    query: &str,
) -> Vec<MetadataFilter> {
    let user_types = vec![audience, UserType::Both];
    let entry_type = classified.entry_type();
    let category = category.filter(|c| !c.is_empty()).map(|c| c.to_string());

    let mut ladder = vec![
        MetadataFilter {
            entry_type,
            user_types: user_types.clone(),
            category: category.clone(),
        },
        MetadataFilter {
            entry_type,
            user_types: user_types.clone(),
            category: None,
        },
        MetadataFilter {
            entry_type: None,
            user_types: user_types.clone(),
            category: None,
        },
    ];

    if classified == QueryType::Howto {
        ladder.push(MetadataFilter {
            entry_type: Some(EntryType::Error),
            user_types: user_types.clone(),
            category: None,
        });
    }
    if classified == QueryType::Definition && query.to_lowercase().contains("error") {
        ladder.push(MetadataFilter {
            entry_type: Some(EntryType::Error),
            user_types,
            category: None,
        });
    }

    let mut deduped: Vec<MetadataFilter> = Vec::with_capacity(ladder.len());
    for filter in ladder {
        if !deduped.contains(&filter) {
            deduped.push(filter);
        }
    }
    deduped
}

/// Whether the query wants a whole document rather than one chunk
fn needs_full_context(query: &str, matched: &[ScoredChunk]) -> bool {
    if query.split_whitespace().count() > 12 {
        return true;
    }
    if HOW_MARKERS.is_match(query) {
        return true;
    }
    // Several chunks of the same parent matching is a strong signal the
    // answer spans the document.
    let mut parents: Vec<&str> = matched
        .iter()
        .map(|s| s.chunk.parent_entry_id.as_str())
        .collect();
    parents.sort_unstable();
    parents.windows(2).any(|w| w[0] == w[1])
}

/// Retrieval component
pub struct Retrieval {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    embedding_cache: MokaCache<String, Arc<Vec<f32>>>,
    similarity_threshold: f64,
    top_k: usize,
    expansion_max_chunks: usize,
    embedding_timeout: std::time::Duration,
    search_timeout: std::time::Duration,
}

impl Retrieval {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: &EngineConfig,
    ) -> Self {
        let embedding_cache = MokaCache::builder()
            .max_capacity(config.embedding_cache_capacity)
            .time_to_live(config.embedding_cache_ttl)
            .build();
        Self {
            embedder,
            index,
            embedding_cache,
            similarity_threshold: config.similarity_threshold,
            top_k: config.retrieval_top_k,
            expansion_max_chunks: config.expansion_max_chunks,
            embedding_timeout: config.timeouts.embedding,
            search_timeout: config.timeouts.vector_search,
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Embed the query, consulting the content-addressed cache first.
    /// Returns (vector, usage, elapsed_ms, cache_hit); cache hits report
    /// zero usage and zero elapsed time.
    async fn embed_query(&self, text: &str) -> crate::error::Result<(Arc<Vec<f32>>, ProviderUsage, u64, bool)> {
        let key = format!("{}:{}", self.embedder.model_id(), normalise_query(text));
        if let Some(vector) = self.embedding_cache.get(&key) {
            return Ok((vector, ProviderUsage { input_tokens: 0, output_tokens: 0 }, 0, true));
        }

        let watch = Stopwatch::start();
        let (vector, usage) = with_timeout(
            "embedder",
            self.embedding_timeout,
            self.embedder.embed(text),
        )
        .await?;
        let elapsed = watch.elapsed_ms();
        let vector = Arc::new(vector);
        self.embedding_cache.insert(key, vector.clone());
        Ok((vector, usage, elapsed, false))
    }

    /// Run the full pipeline. Never fails the request: upstream errors
    /// degrade to an empty outcome, which the orchestrator escalates.
    pub async fn run(&self, enhanced_query: &str, ladder: &[MetadataFilter]) -> RetrievalOutcome {
        let mut outcome = RetrievalOutcome::default();

        let (vector, usage, embed_ms, cache_hit) = match self.embed_query(enhanced_query).await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; retrieval degraded to empty");
                outcome.embedding_usage = ProviderUsage {
                    input_tokens: estimate_tokens(enhanced_query),
                    output_tokens: 0,
                };
                return outcome;
            }
        };
        outcome.embedding_usage = usage;
        outcome.embedding_time_ms = embed_ms;
        outcome.embedding_cache_hit = cache_hit;

        let search_watch = Stopwatch::start();
        let mut winner: Vec<ScoredChunk> = Vec::new();
        for filter in ladder {
            let result = with_timeout(
                "vector_search",
                self.search_timeout,
                self.index
                    .search(vector.as_slice(), self.top_k, filter, self.similarity_threshold),
            )
            .await;
            match result {
                Ok(chunks) => {
                    outcome.attempts.push(SearchAttempt {
                        filter: filter.clone(),
                        outcome_count: chunks.len(),
                    });
                    if !chunks.is_empty() {
                        winner = chunks;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vector search attempt failed");
                    outcome.attempts.push(SearchAttempt {
                        filter: filter.clone(),
                        outcome_count: 0,
                    });
                }
            }
        }
        outcome.documents_matched = winner.len();

        if winner.is_empty() {
            outcome.search_time_ms = search_watch.elapsed_ms();
            return outcome;
        }

        let selected = self.expand_and_select(enhanced_query, winner).await;
        outcome.search_time_ms = search_watch.elapsed_ms();
        outcome.best_confidence = selected
            .iter()
            .map(|s| s.similarity)
            .fold(0.0, f64::max);
        outcome.sources = selected
            .iter()
            .map(|s| SourceRef {
                title: s.chunk.parent_title.clone(),
                section: s.chunk.section_label.clone(),
                category: s.chunk.category.clone(),
                confidence: s.similarity,
            })
            .collect();
        for scored in &selected {
            for title in &scored.chunk.related_documents {
                let cited = outcome.sources.iter().any(|s| &s.title == title);
                if !cited && !outcome.related_titles.contains(title) {
                    outcome.related_titles.push(title.clone());
                }
            }
        }
        outcome.chunks = selected;
        outcome
    }

    /// Deduplicate by parent document, expand to siblings when the query
    /// needs full context, and keep the top-k.
    async fn expand_and_select(&self, query: &str, matched: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let expand = needs_full_context(query, &matched);

        // Best-scoring chunk per parent, preserving rank order
        let mut representatives: Vec<ScoredChunk> = Vec::new();
        for scored in matched {
            if !representatives
                .iter()
                .any(|r| r.chunk.parent_entry_id == scored.chunk.parent_entry_id)
            {
                representatives.push(scored);
            }
        }
        representatives.truncate(self.top_k);

        if !expand {
            return representatives;
        }

        let mut budget = self.expansion_max_chunks;
        let mut selected = Vec::with_capacity(representatives.len());
        for representative in representatives {
            if budget == 0 {
                break;
            }
            let siblings = with_timeout(
                "vector_search",
                self.search_timeout,
                self.index
                    .fetch_siblings(&representative.chunk.parent_entry_id),
            )
            .await
            .unwrap_or_default();

            if siblings.len() <= 1 || siblings.len() > budget {
                budget = budget.saturating_sub(1);
                selected.push(representative);
                continue;
            }

            budget -= siblings.len();
            selected.push(ScoredChunk {
                chunk: merge_siblings(&representative.chunk, siblings),
                similarity: representative.similarity,
            });
        }
        selected
    }
}

/// Concatenate a parent's chunks into one presented document
fn merge_siblings(representative: &KbChunk, siblings: Vec<KbChunk>) -> KbChunk {
    let total = siblings.len() as u32;
    let content = siblings
        .iter()
        .map(|chunk| chunk.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    KbChunk {
        chunk_id: format!("{}:full", representative.parent_entry_id),
        parent_entry_id: representative.parent_entry_id.clone(),
        parent_title: representative.parent_title.clone(),
        content,
        section_label: "full document".to_string(),
        chunk_index: 0,
        total_chunks: total,
        entry_type: representative.entry_type,
        user_type: representative.user_type,
        category: representative.category.clone(),
        related_documents: representative.related_documents.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryVectorIndex;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder: maps known phrases onto fixed unit vectors
    struct StubEmbedder {
        calls: AtomicUsize,
    }

    impl StubEmbedder {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<(Vec<f32>, ProviderUsage)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let vector = if text.contains("photo") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("resize") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            };
            Ok((vector, ProviderUsage { input_tokens: 8, output_tokens: 0 }))
        }

        fn model_id(&self) -> &str {
            "stub-embed"
        }
    }

    fn chunk(id: &str, parent: &str, index: u32, entry_type: EntryType) -> KbChunk {
        KbChunk {
            chunk_id: id.into(),
            parent_entry_id: parent.into(),
            parent_title: format!("{parent} guide"),
            content: format!("chunk {index} of {parent}"),
            section_label: format!("s{index}"),
            chunk_index: index,
            total_chunks: 2,
            entry_type,
            user_type: UserType::Both,
            category: "media".into(),
            related_documents: BTreeSet::new(),
        }
    }

    fn retrieval_with(index: MemoryVectorIndex) -> (Retrieval, Arc<StubEmbedder>) {
        let embedder = Arc::new(StubEmbedder::new());
        let retrieval = Retrieval::new(
            embedder.clone(),
            Arc::new(index),
            &EngineConfig::default(),
        );
        (retrieval, embedder)
    }

    #[test]
    fn test_ladder_for_howto_includes_error_retry() {
        let ladder = fallback_ladder(
            QueryType::Howto,
            Some("media"),
            UserType::External,
            "how do I upload",
        );
        assert_eq!(ladder.len(), 4);
        assert_eq!(ladder[0].entry_type, Some(EntryType::HowTo));
        assert_eq!(ladder[0].category.as_deref(), Some("media"));
        assert_eq!(ladder[1].category, None);
        assert_eq!(ladder[2].entry_type, None);
        assert_eq!(ladder[3].entry_type, Some(EntryType::Error));
    }

    #[test]
    fn test_ladder_definition_with_error_word() {
        let ladder = fallback_ladder(
            QueryType::Definition,
            None,
            UserType::Internal,
            "what is a sync error",
        );
        assert_eq!(ladder.last().unwrap().entry_type, Some(EntryType::Error));
    }

    #[test]
    fn test_ladder_dedupes_when_no_category() {
        let ladder = fallback_ladder(QueryType::General, None, UserType::Both, "anything");
        // No entry type and no category collapses the first three stages
        assert_eq!(ladder.len(), 1);
        assert_eq!(ladder[0].entry_type, None);
    }

    #[tokio::test]
    async fn test_run_records_attempts_until_hit() {
        let index = MemoryVectorIndex::new();
        // Only matches the entry-type-free third stage
        index.insert(chunk("c1", "p1", 0, EntryType::Workflow), vec![1.0, 0.0, 0.0]);
        let (retrieval, _) = retrieval_with(index);

        let ladder = fallback_ladder(QueryType::Howto, Some("media"), UserType::Both, "short");
        let outcome = retrieval.run("photo upload", &ladder).await;

        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[0].outcome_count, 0);
        assert_eq!(outcome.attempts[1].outcome_count, 0);
        assert_eq!(outcome.attempts[2].outcome_count, 1);
        assert_eq!(outcome.chunks.len(), 1);
        assert!(outcome.best_confidence > 0.9);
    }

    #[tokio::test]
    async fn test_empty_outcome_when_nothing_matches() {
        let (retrieval, _) = retrieval_with(MemoryVectorIndex::new());
        let ladder = fallback_ladder(QueryType::General, None, UserType::Both, "q");
        let outcome = retrieval.run("unrelated obscure topic", &ladder).await;
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.best_confidence, 0.0);
        assert!(outcome.attempts.iter().all(|a| a.outcome_count == 0));
    }

    #[tokio::test]
    async fn test_embedding_cache_hit_zeroes_usage_and_time() {
        let index = MemoryVectorIndex::new();
        index.insert(chunk("c1", "p1", 0, EntryType::HowTo), vec![1.0, 0.0, 0.0]);
        let (retrieval, embedder) = retrieval_with(index);
        let ladder = fallback_ladder(QueryType::General, None, UserType::Both, "q");

        let first = retrieval.run("photo upload", &ladder).await;
        assert!(!first.embedding_cache_hit);
        assert_eq!(first.embedding_usage.input_tokens, 8);

        let second = retrieval.run("  Photo   UPLOAD ", &ladder).await;
        assert!(second.embedding_cache_hit);
        assert_eq!(second.embedding_usage.input_tokens, 0);
        assert_eq!(second.embedding_time_ms, 0);
        // Normalised text means the embedder ran exactly once
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parent_expansion_on_how_query() {
        let index = MemoryVectorIndex::new();
        index.insert(chunk("c1", "p1", 0, EntryType::HowTo), vec![1.0, 0.0, 0.0]);
        index.insert(chunk("c2", "p1", 1, EntryType::HowTo), vec![0.8, 0.2, 0.0]);
        let (retrieval, _) = retrieval_with(index);

        let ladder = fallback_ladder(QueryType::Howto, None, UserType::Both, "how do I upload photos");
        let outcome = retrieval.run("how do I upload photos", &ladder).await;

        assert_eq!(outcome.chunks.len(), 1);
        let merged = &outcome.chunks[0];
        assert_eq!(merged.chunk.section_label, "full document");
        assert!(merged.chunk.content.contains("chunk 0 of p1"));
        assert!(merged.chunk.content.contains("chunk 1 of p1"));
    }

    #[tokio::test]
    async fn test_dedup_by_parent_without_expansion() {
        let index = MemoryVectorIndex::new();
        index.insert(chunk("c1", "p1", 0, EntryType::Definition), vec![1.0, 0.0, 0.0]);
        index.insert(chunk("c2", "p2", 0, EntryType::Definition), vec![0.9, 0.1, 0.0]);
        let (retrieval, _) = retrieval_with(index);

        // Short query, no how-markers: no expansion
        let ladder = fallback_ladder(QueryType::Definition, None, UserType::Both, "photo limits");
        let outcome = retrieval.run("photo limits", &ladder).await;
        assert_eq!(outcome.chunks.len(), 2);
        assert_ne!(
            outcome.chunks[0].chunk.parent_entry_id,
            outcome.chunks[1].chunk.parent_entry_id
        );
        assert_eq!(outcome.sources.len(), 2);
    }
}
