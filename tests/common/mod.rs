//! Shared test fixtures: scripted collaborators and a wired engine
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kbase::clients::memory::{MemoryCache, MemoryDurableStore, MemoryVectorIndex};
use kbase::clients::{Chat, ChatReply, ChatRequest, Embedder, ProviderUsage};
use kbase::config::{EngineConfig, RateLimits};
use kbase::kb::{EntryType, KbChunk, UserType};
use kbase::pricing::PriceTable;
use kbase::ratelimit::RateLimiter;
use kbase::Engine;

pub const FULL_RAG_VERDICT: &str = r#"{"is_followup":false,"can_answer_from_context":false,"matched_related_doc":null,"routing":"full_rag","enhanced_query":"","category":"media","intent":"","tags":[]}"#;

/// Chat double: scripted verdict for JSON calls, fixed text otherwise.
/// Summary calls (recognisable by their system prompt) are counted
/// separately.
pub struct ScriptedChat {
    verdict_json: Mutex<String>,
    generation_text: Mutex<String>,
    pub calls: AtomicUsize,
    pub summary_calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self {
            verdict_json: Mutex::new(FULL_RAG_VERDICT.to_string()),
            generation_text: Mutex::new("Here is what I found.".to_string()),
            calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_verdict(&self, verdict: &str) {
        *self.verdict_json.lock().unwrap() = verdict.to_string();
    }

    pub fn set_generation(&self, text: &str) {
        *self.generation_text.lock().unwrap() = text.to_string();
    }
}

#[async_trait]
impl Chat for ScriptedChat {
    async fn complete(&self, request: ChatRequest) -> kbase::Result<ChatReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let is_summary = request
            .system
            .as_deref()
            .map(|s| s.contains("summarizer"))
            .unwrap_or(false);
        let content = if request.json_output {
            self.verdict_json.lock().unwrap().clone()
        } else if is_summary {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            "- user is working through photo uploads".to_string()
        } else {
            self.generation_text.lock().unwrap().clone()
        };
        Ok(ChatReply {
            content,
            model: request.model,
            usage: ProviderUsage {
                input_tokens: 150,
                output_tokens: 40,
            },
        })
    }
}

/// Embedder double with a fixed vocabulary of directions
pub struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> kbase::Result<(Vec<f32>, ProviderUsage)> {
        let lowered = text.to_lowercase();
        let vector = if lowered.contains("photo") || lowered.contains("upload") {
            vec![1.0, 0.0, 0.0]
        } else if lowered.contains("resize") || lowered.contains("image") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        };
        Ok((
            vector,
            ProviderUsage {
                input_tokens: 5,
                output_tokens: 0,
            },
        ))
    }

    fn model_id(&self) -> &str {
        "nomic-embed-text"
    }
}

pub fn kb_chunk(
    chunk_id: &str,
    parent: &str,
    title: &str,
    index: u32,
    entry_type: EntryType,
) -> KbChunk {
    KbChunk {
        chunk_id: chunk_id.into(),
        parent_entry_id: parent.into(),
        parent_title: title.into(),
        content: format!("Section {index} of {title}."),
        section_label: format!("part-{index}"),
        chunk_index: index,
        total_chunks: 2,
        entry_type,
        user_type: UserType::Both,
        category: "media".into(),
        related_documents: BTreeSet::new(),
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub limiter: Arc<RateLimiter>,
    pub chat: Arc<ScriptedChat>,
    pub durable: Arc<MemoryDurableStore>,
    pub cache: Arc<MemoryCache>,
}

/// Wire an engine over in-memory collaborators with a seeded photo/resize KB
pub fn harness(limits: Option<RateLimits>) -> Harness {
    let mut config = EngineConfig::default();
    if let Some(limits) = limits {
        config.rate_limits = limits;
    }

    let chat = Arc::new(ScriptedChat::new());
    let durable = Arc::new(MemoryDurableStore::new());
    let cache = Arc::new(MemoryCache::new());

    let index = MemoryVectorIndex::new();
    let mut up0 = kb_chunk("up-0", "upload-photos", "Upload Photos Guide", 0, EntryType::HowTo);
    up0.related_documents.insert("How to resize images".to_string());
    index.insert(up0, vec![1.0, 0.0, 0.0]);
    let mut up1 = kb_chunk("up-1", "upload-photos", "Upload Photos Guide", 1, EntryType::HowTo);
    up1.related_documents.insert("How to resize images".to_string());
    index.insert(up1, vec![0.9, 0.1, 0.0]);
    index.insert(
        kb_chunk("rs-0", "resize-images", "How to resize images", 0, EntryType::HowTo),
        vec![0.0, 1.0, 0.0],
    );

    let limiter = Arc::new(RateLimiter::new(
        cache.clone(),
        config.rate_limits.clone(),
        config.timeouts.cache,
    ));
    let engine = Arc::new(Engine::new(
        config,
        PriceTable::default(),
        chat.clone(),
        Arc::new(KeywordEmbedder),
        Arc::new(index),
        cache.clone(),
        durable.clone(),
    ));

    Harness {
        engine,
        limiter,
        chat,
        durable,
        cache,
    }
}
