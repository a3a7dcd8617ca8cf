//! Error types for kbase

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An upstream collaborator (LLM, embedder, vector index, cache) failed
    #[error("Upstream error ({service}): {detail}")]
    Upstream { service: &'static str, detail: String },

    /// An upstream call exceeded its timeout budget
    #[error("Timeout calling {service} after {timeout_ms}ms")]
    Timeout { service: &'static str, timeout_ms: u64 },

    /// The overall request deadline elapsed
    #[error("Request deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// Session has been ended and accepts no further messages
    #[error("Session ended: {0}")]
    SessionEnded(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
