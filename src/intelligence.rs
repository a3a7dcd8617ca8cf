//! Query intelligence
//!
//! One LLM call that collapses followup detection, context-answerability,
//! related-document matching, and search-query enhancement, saving three
//! sequential round-trips. The model's JSON is decoded and validated; a
//! verdict that fails validation is replaced by the fallback verdict, which
//! is a value the caller can assert on, not an error.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::classify::Classification;
use crate::clients::{with_timeout, Chat, ChatRequest, ProviderUsage};
use crate::pricing::estimate_tokens;
use crate::session::SessionContext;

/// Orchestrator branch selected for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    AnswerFromContext,
    SearchKbTargeted,
    FullRag,
}

/// Validated verdict driving the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIntelligenceVerdict {
    pub is_followup: bool,
    pub can_answer_from_context: bool,
    pub matched_related_doc: Option<String>,
    pub routing: Routing,
    pub enhanced_query: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl QueryIntelligenceVerdict {
    /// The verdict used when the model's output cannot be trusted
    pub fn fallback(original_query: &str) -> Self {
        Self {
            is_followup: false,
            can_answer_from_context: false,
            matched_related_doc: None,
            routing: Routing::FullRag,
            enhanced_query: original_query.to_string(),
            category: String::new(),
            intent: String::new(),
            tags: Vec::new(),
        }
    }
}

/// Discriminated result: a validated model verdict or the fallback value
#[derive(Debug, Clone)]
pub enum IntelligenceOutcome {
    Validated(QueryIntelligenceVerdict),
    Fallback(QueryIntelligenceVerdict),
}

impl IntelligenceOutcome {
    pub fn verdict(&self) -> &QueryIntelligenceVerdict {
        match self {
            IntelligenceOutcome::Validated(v) | IntelligenceOutcome::Fallback(v) => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, IntelligenceOutcome::Fallback(_))
    }
}

const INTELLIGENCE_MAX_TOKENS: u32 = 500;
const INTELLIGENCE_TEMPERATURE: f32 = 0.0;

const INTELLIGENCE_SYSTEM_PROMPT: &str = "You analyse support queries for a knowledge-base \
assistant. Given the user's query, its pattern classification, and the recent conversation, \
reply with ONLY a JSON object with these fields:\n\
  is_followup: boolean - does the query continue the prior conversation?\n\
  can_answer_from_context: boolean - can it be answered from the conversation alone?\n\
  matched_related_doc: string or null - a document title from the conversation's cited \
sources that directly answers the query, if any\n\
  routing: one of \"answer_from_context\", \"search_kb_targeted\", \"full_rag\"\n\
  enhanced_query: string - the query rewritten as a standalone search query with \
conversation references resolved\n\
  category: string - short topic label (e.g. \"media\", \"billing\", \"listings\")\n\
  intent: string - what the user is trying to do, one phrase\n\
  tags: array of strings - up to 5 keywords\n\
Use \"answer_from_context\" only when the conversation already contains the answer. Use \
\"search_kb_targeted\" only when matched_related_doc names a cited source. Otherwise use \
\"full_rag\".";

/// Query-intelligence component
pub struct Intelligence {
    chat: Arc<dyn Chat>,
    model: String,
    llm_timeout: Duration,
}

impl Intelligence {
    pub fn new(chat: Arc<dyn Chat>, model: String, llm_timeout: Duration) -> Self {
        Self { chat, model, llm_timeout }
    }

    pub fn model_id(&self) -> &str {
        &self.model
    }

    /// Run the consolidated analysis call. Always returns a usable outcome
    /// plus the usage to account for the call (estimated when the provider
    /// reported none).
    pub async fn assess(
        &self,
        query: &str,
        classification: Classification,
        context: &SessionContext,
    ) -> (IntelligenceOutcome, ProviderUsage) {
        let formatted_context = context.formatted();
        let prompt = format!(
            "Query: {query}\nClassified type: {} (confidence {:.2})\n\nConversation so far:\n{}",
            classification.query_type,
            classification.confidence,
            if formatted_context.is_empty() { "(none)" } else { formatted_context.as_str() }
        );

        let request = ChatRequest {
            model: self.model.clone(),
            prompt: prompt.clone(),
            max_tokens: INTELLIGENCE_MAX_TOKENS,
            temperature: INTELLIGENCE_TEMPERATURE,
            system: Some(INTELLIGENCE_SYSTEM_PROMPT.to_string()),
            json_output: true,
        };

        match with_timeout("llm", self.llm_timeout, self.chat.complete(request)).await {
            Ok(reply) => {
                let outcome = validate_verdict(&reply.content, query, context);
                (outcome, reply.usage)
            }
            Err(e) => {
                tracing::warn!(error = %e, "query intelligence call failed; using fallback verdict");
                let usage = ProviderUsage {
                    input_tokens: estimate_tokens(&prompt),
                    output_tokens: 0,
                };
                (
                    IntelligenceOutcome::Fallback(QueryIntelligenceVerdict::fallback(query)),
                    usage,
                )
            }
        }
    }
}

/// Extract the JSON object from a model reply that may carry code fences or
/// prose around it.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Decode and validate a raw verdict. Invalid routing, malformed JSON, or
/// missing fields all produce the fallback value.
pub fn validate_verdict(raw: &str, original_query: &str, context: &SessionContext) -> IntelligenceOutcome {
    let Some(json) = extract_json(raw) else {
        return IntelligenceOutcome::Fallback(QueryIntelligenceVerdict::fallback(original_query));
    };
    let Ok(mut verdict) = serde_json::from_str::<QueryIntelligenceVerdict>(json) else {
        return IntelligenceOutcome::Fallback(QueryIntelligenceVerdict::fallback(original_query));
    };

    if verdict.enhanced_query.trim().is_empty() {
        verdict.enhanced_query = original_query.to_string();
    }

    let routing_valid = match verdict.routing {
        Routing::AnswerFromContext => {
            verdict.can_answer_from_context
                && !context.is_empty()
                && !context.looks_error_only()
        }
        Routing::SearchKbTargeted => match &verdict.matched_related_doc {
            Some(title) => context.prior_source_titles().iter().any(|t| t == title),
            None => false,
        },
        Routing::FullRag => true,
    };

    if routing_valid {
        IntelligenceOutcome::Validated(verdict)
    } else {
        IntelligenceOutcome::Fallback(QueryIntelligenceVerdict::fallback(original_query))
    }
}
