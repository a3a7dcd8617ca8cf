//! Grounded response generation
//!
//! Three entry points over one underlying call shape: grounded (KB chunks
//! attached), context-only (answer from the conversation), and fallback (no
//! KB results). A usage entry is produced even when the provider call fails,
//! using the tokeniser estimate, so accounting stays complete.

use std::sync::Arc;
use std::time::Duration;

use crate::clients::{with_timeout, Chat, ChatRequest, ProviderUsage};
use crate::kb::ScoredChunk;
use crate::metrics::EscalationReason;
use crate::pricing::estimate_tokens;

const GENERATION_MAX_TOKENS: u32 = 1024;
const GENERATION_TEMPERATURE: f32 = 0.4;

const GROUNDED_SYSTEM_PROMPT: &str = "You are a support assistant for a property-listings \
platform. Answer the user's question using ONLY the knowledge-base articles provided. Be \
concise and practical. If the articles partially cover the question, answer what they cover \
and say what is missing. Never invent features, limits, or steps. Do not list article titles \
in your reply; they are shown to the user separately.";

const CONTEXT_SYSTEM_PROMPT: &str = "You are a support assistant continuing a conversation. \
Answer the user's question using only what was already said in the conversation. Be concise. \
If the conversation does not actually contain the answer, say so plainly.";

const FALLBACK_SYSTEM_PROMPT: &str = "You are a support assistant. The knowledge base has no \
article covering this question. Give brief general guidance where you safely can, be explicit \
that you could not find a documented answer, and invite the user to raise a support ticket \
for a definitive one.";

/// Canned escalation invitation appended by the orchestrator
pub fn escalation_prompt(reason: EscalationReason) -> &'static str {
    match reason {
        EscalationReason::NoResults => {
            "\n\nI couldn't find an answer to this in our knowledge base. Would you like me to raise a support ticket so someone can follow up?"
        }
        EscalationReason::LowConfidence => {
            "\n\nI may not have this completely right. Would you like me to connect you with our support team to confirm?"
        }
        EscalationReason::UserRequested => {
            "I can get you to a human. Would you like me to raise a support ticket with our support team?"
        }
        EscalationReason::None => "",
    }
}

/// One finished generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub usage: ProviderUsage,
    /// The provider call failed and `text` is the apology fallback
    pub degraded: bool,
}

/// Response-generation component
pub struct Generator {
    chat: Arc<dyn Chat>,
    model: String,
    llm_timeout: Duration,
}

impl Generator {
    pub fn new(chat: Arc<dyn Chat>, model: String, llm_timeout: Duration) -> Self {
        Self { chat, model, llm_timeout }
    }

    pub fn model_id(&self) -> &str {
        &self.model
    }

    /// Grounded mode: KB chunks attached as authoritative context
    pub async fn generate_grounded(
        &self,
        query: &str,
        context_text: &str,
        chunks: &[ScoredChunk],
    ) -> GenerationResult {
        let mut prompt = String::new();
        if !context_text.is_empty() {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(context_text);
            prompt.push('\n');
        }
        prompt.push_str("Knowledge-base articles:\n\n");
        for scored in chunks {
            prompt.push_str(&format!(
                "--- {} ({}) [relevance {:.2}] ---\n{}\n\n",
                scored.chunk.parent_title,
                scored.chunk.section_label,
                scored.similarity,
                scored.chunk.content
            ));
        }
        prompt.push_str(&format!("Question: {query}"));

        self.call(GROUNDED_SYSTEM_PROMPT, prompt).await
    }

    /// Context-only mode: the conversation is the grounding
    pub async fn generate_from_context(&self, query: &str, context_text: &str) -> GenerationResult {
        let prompt = format!("Conversation so far:\n{context_text}\nQuestion: {query}");
        self.call(CONTEXT_SYSTEM_PROMPT, prompt).await
    }

    /// Fallback mode: retrieval found nothing usable
    pub async fn generate_fallback(&self, query: &str, context_text: &str) -> GenerationResult {
        let mut prompt = String::new();
        if !context_text.is_empty() {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(context_text);
            prompt.push('\n');
        }
        prompt.push_str(&format!("Question: {query}"));
        self.call(FALLBACK_SYSTEM_PROMPT, prompt).await
    }

    async fn call(&self, system: &str, prompt: String) -> GenerationResult {
        let estimated_input = estimate_tokens(&prompt) + estimate_tokens(system);
        let request = ChatRequest {
            model: self.model.clone(),
            prompt,
            max_tokens: GENERATION_MAX_TOKENS,
            temperature: GENERATION_TEMPERATURE,
            system: Some(system.to_string()),
            json_output: false,
        };

        match with_timeout("llm", self.llm_timeout, self.chat.complete(request)).await {
            Ok(reply) => GenerationResult {
                text: reply.content,
                usage: reply.usage,
                degraded: false,
            },
            Err(e) => {
                tracing::error!(error = %e, "response generation failed");
                GenerationResult {
                    text: "I'm having trouble generating an answer right now.".to_string(),
                    usage: ProviderUsage {
                        input_tokens: estimated_input,
                        output_tokens: 0,
                    },
                    degraded: true,
                }
            }
        }
    }
}
