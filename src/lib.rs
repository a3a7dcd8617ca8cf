//! KBase - Conversational knowledge-base answering engine
//!
//! Query orchestration over a curated knowledge base: session management
//! across a fast cache and a durable store, LLM-driven routing and search
//! enhancement, filtered vector retrieval with progressive fallback,
//! grounded response generation, and per-query cost/latency metrics.

pub mod accounting;
pub mod classify;
pub mod clients;
pub mod config;
pub mod error;
pub mod generate;
pub mod intelligence;
pub mod kb;
pub mod metrics;
pub mod orchestrator;
pub mod pricing;
pub mod ratelimit;
pub mod retrieval;
pub mod server;
pub mod session;

// Re-export main types
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use orchestrator::{Engine, QueryOutcome, QueryRequest};

// Re-export the collaborator interfaces
pub use clients::{Cache, Chat, DurableStore, Embedder, VectorIndex};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
