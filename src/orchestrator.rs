//! Query orchestration engine
//!
//! One state machine per request:
//!
//! ```text
//! START → CLASSIFY → (GREETING_SHORTCUT | INTELLIGENCE) →
//!         (CONTEXT_ANSWER | RETRIEVE → GENERATE | GENERATE_FALLBACK) →
//!         WRITE_BACK → FINALISE → END
//! ```
//!
//! The per-session lock is held only across WRITE_BACK (user append through
//! assistant append), so intra-session log order is strict while the LLM
//! phases of different requests run in parallel.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::accounting::{Accountant, Operation};
use crate::classify::{classify, greeting_reply, wants_human, Classification, QueryType};
use crate::clients::{
    Cache, Chat, DurableStore, Embedder, FailureRecord, FailureState, FeedbackRating,
    FeedbackRecord, VectorIndex,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::generate::{escalation_prompt, GenerationResult, Generator};
use crate::intelligence::{Intelligence, QueryIntelligenceVerdict, Routing};
use crate::kb::UserType;
use crate::metrics::{EscalationReason, MetricsSink, QueryMetrics, Stopwatch};
use crate::pricing::PriceTable;
use crate::retrieval::{fallback_ladder, Retrieval, SourceRef};
use crate::session::{
    EndReason, MessageMetadata, SessionHeader, SessionStore, StoredMessage,
};

const MESSAGE_MAX_CHARS: usize = 4000;

/// One incoming query, transport-independent
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub message: String,
    pub session_id: Option<String>,
    /// Rate-limit / attribution identity
    pub identity: String,
    /// Audience filter from the agent profile
    pub audience: UserType,
}

/// Context snapshot exposed on the debug surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ContextDebug {
    pub formatted: String,
    pub recent_count: usize,
    pub has_summary: bool,
}

/// Finished query, everything the transport layer shapes per flavour
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub response_text: String,
    pub session_id: String,
    pub requires_escalation: bool,
    pub confidence: f64,
    pub sources: Vec<SourceRef>,
    pub classification: Classification,
    pub context_debug: ContextDebug,
    pub metrics: QueryMetrics,
}

/// The orchestration engine
pub struct Engine {
    config: EngineConfig,
    prices: PriceTable,
    sessions: SessionStore,
    retrieval: Retrieval,
    intelligence: Intelligence,
    generator: Generator,
    chat: Arc<dyn Chat>,
    embedding_model: String,
    accountant: Accountant,
    metrics: MetricsSink,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        prices: PriceTable,
        chat: Arc<dyn Chat>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        cache: Arc<dyn Cache>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let embedding_model = embedder.model_id().to_string();
        let sessions = SessionStore::new(cache, durable, &config);
        let retrieval = Retrieval::new(embedder, index, &config);
        let intelligence = Intelligence::new(
            chat.clone(),
            config.chat_model.clone(),
            config.timeouts.llm,
        );
        let generator = Generator::new(
            chat.clone(),
            config.chat_model.clone(),
            config.timeouts.llm,
        );
        Self {
            config,
            prices,
            sessions,
            retrieval,
            intelligence,
            generator,
            chat,
            embedding_model,
            accountant: Accountant::new(),
            metrics: MetricsSink::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics_sink(&self) -> &MetricsSink {
        &self.metrics
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        self.sessions.durable()
    }

    /// Process one query end to end. Only request validation errors surface
    /// as `Err`; every upstream failure degrades into an escalated response.
    pub async fn process(&self, request: QueryRequest) -> Result<QueryOutcome> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(Error::InvalidInput("message is required".into()));
        }
        if message.chars().count() > MESSAGE_MAX_CHARS {
            return Err(Error::InvalidInput(format!(
                "message too long (max {MESSAGE_MAX_CHARS} chars)"
            )));
        }

        let watch = Stopwatch::start();
        let deadline_ms = self.config.timeouts.deadline.as_millis() as u64;

        let session_id = self.resolve_session(&request).await?;
        let query_id = Uuid::new_v4().to_string();
        self.accountant.open_window(&query_id);

        let mut metrics = QueryMetrics::new(&session_id, &message);
        metrics.search_execution.similarity_threshold = self.config.similarity_threshold;

        // CLASSIFY
        let classify_watch = Stopwatch::start();
        let classification = classify(&message);
        metrics.classification_time_ms = classify_watch.elapsed_ms();
        metrics.classified_type = classification.query_type;
        metrics.classification_confidence = classification.confidence;

        let context = self.sessions.read_context(&session_id).await;
        metrics.session_degraded = context.degraded;
        let formatted_context = context.formatted();
        let context_debug = ContextDebug {
            formatted: formatted_context.clone(),
            recent_count: context.recent.len(),
            has_summary: context.summary.is_some(),
        };

        // GREETING_SHORTCUT: canned reply, zero LLM usage
        if classification.query_type == QueryType::Greeting {
            let response = greeting_reply().to_string();
            return self
                .write_back_and_finalise(
                    &query_id, &session_id, &message, response, Vec::new(), Vec::new(), 0.0,
                    metrics, classification, context_debug, watch,
                )
                .await;
        }

        // USER_REQUESTED escalation short-circuits intelligence entirely
        if wants_human(&message, &self.config.escalation_phrases) {
            metrics.escalated = true;
            metrics.escalation_reason = EscalationReason::UserRequested;
            let response = escalation_prompt(EscalationReason::UserRequested).to_string();
            return self
                .write_back_and_finalise(
                    &query_id, &session_id, &message, response, Vec::new(), Vec::new(), 0.0,
                    metrics, classification, context_debug, watch,
                )
                .await;
        }

        // INTELLIGENCE
        if self.deadline_exhausted(&watch) {
            return self
                .deadline_finalise(
                    &query_id, &session_id, &message, metrics, classification, context_debug,
                    deadline_ms,
                )
                .await;
        }
        let intel_watch = Stopwatch::start();
        let (outcome, intel_usage) = self
            .intelligence
            .assess(&message, classification, &context)
            .await;
        metrics.query_intelligence_time_ms = intel_watch.elapsed_ms();
        metrics.query_intelligence_fallback = outcome.is_fallback();
        self.accountant.record(
            &query_id,
            Operation::QueryIntelligence,
            self.intelligence.model_id(),
            intel_usage.input_tokens,
            intel_usage.output_tokens,
            &self.prices,
        );
        let verdict = outcome.verdict().clone();
        metrics.enhanced_query = verdict.enhanced_query.clone();
        metrics.routing = verdict.routing;

        // Branch on the routing decision
        let (mut response, sources, related, confidence) = match verdict.routing {
            Routing::AnswerFromContext => {
                // CONTEXT_ANSWER: one LLM call, search fields stay zeroed
                let gen_watch = Stopwatch::start();
                let generation = self
                    .generator
                    .generate_from_context(&message, &formatted_context)
                    .await;
                metrics.response_generation_time_ms = gen_watch.elapsed_ms();
                self.record_generation(&query_id, &generation);
                if generation.degraded {
                    metrics.escalated = true;
                    metrics.escalation_reason = EscalationReason::NoResults;
                }
                (generation.text, Vec::new(), Vec::new(), 0.0)
            }
            Routing::SearchKbTargeted | Routing::FullRag => {
                if self.deadline_exhausted(&watch) {
                    return self
                        .deadline_finalise(
                            &query_id, &session_id, &message, metrics, classification,
                            context_debug, deadline_ms,
                        )
                        .await;
                }
                self.retrieve_and_generate(
                    &query_id, &message, &verdict, request.audience, &formatted_context,
                    &mut metrics,
                )
                .await
            }
        };

        // Append the canned escalation invitation for engine-driven reasons
        if metrics.escalated && metrics.escalation_reason != EscalationReason::UserRequested {
            response.push_str(escalation_prompt(metrics.escalation_reason));
        }

        self.write_back_and_finalise(
            &query_id, &session_id, &message, response, sources, related, confidence, metrics,
            classification, context_debug, watch,
        )
        .await
    }

    /// RETRIEVE → (GENERATE | GENERATE_FALLBACK)
    async fn retrieve_and_generate(
        &self,
        query_id: &str,
        message: &str,
        verdict: &QueryIntelligenceVerdict,
        audience: UserType,
        formatted_context: &str,
        metrics: &mut QueryMetrics,
    ) -> (String, Vec<SourceRef>, Vec<String>, f64) {
        let ladder = fallback_ladder(
            metrics.classified_type,
            Some(verdict.category.as_str()),
            audience,
            message,
        );
        let retrieval = self.retrieval.run(&verdict.enhanced_query, &ladder).await;

        self.accountant.record(
            query_id,
            Operation::Embedding,
            &self.embedding_model,
            retrieval.embedding_usage.input_tokens,
            retrieval.embedding_usage.output_tokens,
            &self.prices,
        );

        metrics.search_execution.filters_applied = retrieval.attempts.len();
        metrics.search_execution.documents_scanned =
            retrieval.attempts.iter().map(|a| a.outcome_count).sum();
        metrics.search_execution.attempts = retrieval.attempts.clone();
        metrics.search_execution.documents_matched = retrieval.documents_matched;
        metrics.search_execution.documents_returned = retrieval.chunks.len();
        metrics.search_execution.embedding_time_ms = retrieval.embedding_time_ms;
        metrics.search_execution.search_time_ms = retrieval.search_time_ms;
        metrics.sources_found = retrieval.sources.len();
        metrics.best_confidence = retrieval.best_confidence;

        if retrieval.chunks.is_empty() {
            // GENERATE_FALLBACK
            let gen_watch = Stopwatch::start();
            let generation = self
                .generator
                .generate_fallback(message, formatted_context)
                .await;
            metrics.response_generation_time_ms = gen_watch.elapsed_ms();
            self.record_generation(query_id, &generation);
            metrics.escalated = true;
            metrics.escalation_reason = EscalationReason::NoResults;
            return (generation.text, Vec::new(), Vec::new(), 0.0);
        }

        // GENERATE (grounded)
        let gen_watch = Stopwatch::start();
        let generation = self
            .generator
            .generate_grounded(message, formatted_context, &retrieval.chunks)
            .await;
        metrics.response_generation_time_ms = gen_watch.elapsed_ms();
        self.record_generation(query_id, &generation);
        metrics.sources_used = retrieval.chunks.len();

        if generation.degraded {
            metrics.escalated = true;
            metrics.escalation_reason = EscalationReason::NoResults;
        } else if retrieval.best_confidence < self.config.low_confidence_escalation_threshold {
            metrics.escalated = true;
            metrics.escalation_reason = EscalationReason::LowConfidence;
        }

        (
            generation.text,
            retrieval.sources,
            retrieval.related_titles,
            retrieval.best_confidence,
        )
    }

    fn record_generation(&self, query_id: &str, generation: &GenerationResult) {
        self.accountant.record(
            query_id,
            Operation::ResponseGeneration,
            self.generator.model_id(),
            generation.usage.input_tokens,
            generation.usage.output_tokens,
            &self.prices,
        );
    }

    fn deadline_exhausted(&self, watch: &Stopwatch) -> bool {
        watch.elapsed_ms() >= self.config.timeouts.deadline.as_millis() as u64
    }

    /// Deadline path: no response was generated, emit partial metrics.
    #[allow(clippy::too_many_arguments)]
    async fn deadline_finalise(
        &self,
        query_id: &str,
        session_id: &str,
        message: &str,
        mut metrics: QueryMetrics,
        classification: Classification,
        context_debug: ContextDebug,
        deadline_ms: u64,
    ) -> Result<QueryOutcome> {
        metrics.escalated = true;
        metrics.escalation_reason = EscalationReason::NoResults;
        let response = format!(
            "This is taking longer than it should.{}",
            escalation_prompt(EscalationReason::NoResults)
        );
        let (_, breakdown) = self.accountant.settle(query_id, session_id);
        metrics.cost_breakdown = breakdown;
        metrics.total_time_ms = deadline_ms;

        self.append_turn(session_id, message, &response, &[], &[], 0.0, &metrics)
            .await;

        let outcome = QueryOutcome {
            response_text: response,
            session_id: session_id.to_string(),
            requires_escalation: true,
            confidence: 0.0,
            sources: Vec::new(),
            classification,
            context_debug,
            metrics: metrics.clone(),
        };
        self.metrics.emit(metrics);
        Ok(outcome)
    }

    /// WRITE_BACK → FINALISE
    #[allow(clippy::too_many_arguments)]
    async fn write_back_and_finalise(
        &self,
        query_id: &str,
        session_id: &str,
        message: &str,
        response: String,
        sources: Vec<SourceRef>,
        related: Vec<String>,
        confidence: f64,
        mut metrics: QueryMetrics,
        classification: Classification,
        context_debug: ContextDebug,
        watch: Stopwatch,
    ) -> Result<QueryOutcome> {
        let (entries, breakdown) = self.accountant.settle(query_id, session_id);
        metrics.cost_breakdown = breakdown;

        // Greeting and user-requested shortcuts legitimately record no
        // usage; every other path made at least the intelligence call.
        let shortcut = classification.query_type == QueryType::Greeting
            || metrics.escalation_reason == EscalationReason::UserRequested;
        if !shortcut && entries.is_empty() {
            tracing::error!(session_id, "no token usage recorded for an LLM-bearing query");
            metrics.invariant_violation = true;
        }

        let message_count = self
            .append_turn(session_id, message, &response, &sources, &related, confidence, &metrics)
            .await;

        if let Some(count) = message_count {
            self.sessions
                .maybe_summarize(
                    self.chat.as_ref(),
                    &self.accountant,
                    &self.prices,
                    &self.config.summary_model,
                    session_id,
                    count,
                )
                .await;

            if count >= self.config.session_message_cap as u64 {
                tracing::info!(session_id, count, "session reached message cap");
                if let Err(e) = self.end_session(session_id, EndReason::MessageCap).await {
                    tracing::warn!(session_id, error = %e, "message-cap session end failed");
                }
            }
        }

        metrics.total_time_ms = watch.elapsed_ms();
        let requires_escalation = metrics.escalated;
        let outcome = QueryOutcome {
            response_text: response,
            session_id: session_id.to_string(),
            requires_escalation,
            confidence,
            sources,
            classification,
            context_debug,
            metrics: metrics.clone(),
        };
        self.metrics.emit(metrics);
        Ok(outcome)
    }

    /// Append the user/assistant pair under the per-session lock. Message
    /// timestamps are taken inside the lock so the durable log is
    /// monotonically ordered per session.
    async fn append_turn(
        &self,
        session_id: &str,
        message: &str,
        response: &str,
        sources: &[SourceRef],
        related: &[String],
        confidence: f64,
        metrics: &QueryMetrics,
    ) -> Option<u64> {
        let _guard = self.sessions.lock_session(session_id).await;

        let user_message = StoredMessage::user(message);
        if let Err(e) = self.sessions.append(session_id, &user_message).await {
            tracing::error!(session_id, error = %e, "user append failed");
        }

        let assistant_message = StoredMessage::assistant(
            response,
            MessageMetadata {
                sources: sources.iter().map(|s| s.title.clone()).collect(),
                related: related.to_vec(),
                confidence,
                cost: metrics.cost_breakdown.clone(),
            },
        );
        match self.sessions.append(session_id, &assistant_message).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(session_id, error = %e, "assistant append failed");
                None
            }
        }
    }

    /// Resolve the request's session: reuse a live one, lazily expire an
    /// idle one, and treat ended/unknown ids as new sessions.
    async fn resolve_session(&self, request: &QueryRequest) -> Result<String> {
        if let Some(id) = &request.session_id {
            match self.sessions.session_header(id).await {
                Ok(Some(header)) if !header.is_ended() => {
                    let idle = Utc::now() - header.last_activity_at;
                    let ttl = chrono::Duration::from_std(self.config.session_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(7200));
                    if idle >= ttl {
                        tracing::info!(session_id = %id, "session idle past TTL; ending");
                        if let Err(e) = self.end_session(id, EndReason::Inactivity).await {
                            tracing::warn!(session_id = %id, error = %e, "inactivity end failed");
                        }
                        return self.new_session(None, &request.identity).await;
                    }
                    return Ok(id.clone());
                }
                // Ended sessions behave as unknown ids: a fresh session
                // under a fresh id.
                Ok(Some(_)) => return self.new_session(None, &request.identity).await,
                // Unknown id: adopt it so the client's handle keeps working.
                Ok(None) => return self.new_session(Some(id.clone()), &request.identity).await,
                Err(e) => {
                    tracing::warn!(error = %e, "session lookup failed; starting fresh session");
                    return self.new_session(None, &request.identity).await;
                }
            }
        }
        self.new_session(None, &request.identity).await
    }

    async fn new_session(&self, id: Option<String>, identity: &str) -> Result<String> {
        let session_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let header = SessionHeader::new(&session_id, identity);
        if let Err(e) = self.sessions.create_session(&header).await {
            // A degraded durable tier must not fail the query
            tracing::warn!(session_id = %session_id, error = %e, "session create failed; continuing degraded");
        }
        Ok(session_id)
    }

    /// End a session: mark it, batch-flush its buffered metrics, and roll
    /// its totals into the identity aggregates.
    pub async fn end_session(&self, session_id: &str, reason: EndReason) -> Result<()> {
        let header = self.sessions.session_header(session_id).await?;
        self.sessions.end_session(session_id, reason).await?;

        let records = self.metrics.flush_session(session_id);
        if !records.is_empty() {
            if let Err(e) = self
                .sessions
                .durable()
                .store_metrics_batch(session_id, &records)
                .await
            {
                tracing::error!(session_id, error = %e, "metrics batch flush failed");
            }
        }

        let totals = self.accountant.drain_session(session_id);
        if let Some(header) = header {
            if totals.queries > 0 || totals.cost_usd > 0.0 {
                if let Err(e) = self
                    .sessions
                    .durable()
                    .update_identity_aggregates(&header.identity, totals.queries, totals.cost_usd)
                    .await
                {
                    tracing::error!(session_id, error = %e, "identity aggregate update failed");
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ancillary surfaces
    // ------------------------------------------------------------------

    pub async fn record_feedback(
        &self,
        session_id: &str,
        rating: FeedbackRating,
        comment: Option<String>,
    ) -> Result<String> {
        let record = FeedbackRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            rating,
            comment,
            created_at: Utc::now(),
        };
        self.sessions.durable().record_feedback(&record).await?;
        Ok(record.id)
    }

    pub async fn record_failure(
        &self,
        session_id: &str,
        query_text: &str,
        reason: &str,
    ) -> Result<String> {
        let record = FailureRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            query_text: query_text.to_string(),
            reason: reason.to_string(),
            state: FailureState::Recorded,
            created_at: Utc::now(),
        };
        self.sessions.durable().record_failure(&record).await?;
        Ok(record.id)
    }

    /// Hand a recorded failure to the ticket subsystem. A ticket ends the
    /// originating session.
    pub async fn create_ticket(&self, failure_id: &str) -> Result<bool> {
        let Some(failure) = self.sessions.durable().get_failure(failure_id).await? else {
            return Ok(false);
        };
        let updated = self
            .sessions
            .durable()
            .set_failure_state(failure_id, FailureState::TicketCreated)
            .await?;
        if updated {
            if let Err(e) = self.end_session(&failure.session_id, EndReason::Escalated).await {
                tracing::warn!(failure_id, error = %e, "escalated session end failed");
            }
        }
        Ok(updated)
    }

    pub async fn decline_failure(&self, failure_id: &str) -> Result<bool> {
        self.sessions
            .durable()
            .set_failure_state(failure_id, FailureState::Declined)
            .await
    }
}
