//! Ollama embedding client
//!
//! HTTP client for generating query embeddings via an Ollama instance.

use async_trait::async_trait;
use ollama_rs::generation::embeddings::request::GenerateEmbeddingsRequest;
use ollama_rs::Ollama;

use super::{Embedder, ProviderUsage};
use crate::error::{Error, Result};
use crate::pricing::estimate_tokens;

/// Embedder backed by Ollama's embeddings API
pub struct OllamaEmbedder {
    ollama: Ollama,
    model: String,
}

impl OllamaEmbedder {
    /// # Arguments
    /// * `host` - Ollama host (e.g., "http://localhost")
    /// * `port` - Ollama port (default: 11434)
    /// * `model` - Embedding model name (e.g., "nomic-embed-text")
    pub fn new(host: &str, port: u16, model: String) -> Self {
        Self {
            ollama: Ollama::new(host.to_string(), port),
            model,
        }
    }

    /// Create from environment.
    ///
    /// Reads:
    /// - `OLLAMA_ENDPOINT` (default: "http://localhost:11434")
    /// - `EMBEDDING_MODEL` (default: "nomic-embed-text")
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("OLLAMA_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());

        let url = url::Url::parse(&endpoint)
            .map_err(|e| Error::Configuration(format!("Invalid OLLAMA_ENDPOINT URL: {e}")))?;

        let host = format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or("localhost")
        );
        let port = url.port().unwrap_or(11434);

        let model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "nomic-embed-text".to_string());

        Ok(Self::new(&host, port, model))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<(Vec<f32>, ProviderUsage)> {
        let request = GenerateEmbeddingsRequest::new(self.model.clone(), text.into());

        let response = self
            .ollama
            .generate_embeddings(request)
            .await
            .map_err(|e| Error::Upstream {
                service: "embedder",
                detail: format!("Ollama embedding error: {e}"),
            })?;

        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Upstream {
                service: "embedder",
                detail: "no embedding returned".to_string(),
            })?;

        // Ollama does not report usage; estimate input tokens from the text
        let usage = ProviderUsage {
            input_tokens: estimate_tokens(text),
            output_tokens: 0,
        };

        Ok((embedding, usage))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults() {
        std::env::remove_var("OLLAMA_ENDPOINT");
        std::env::remove_var("EMBEDDING_MODEL");
        let embedder = OllamaEmbedder::from_env().unwrap();
        assert_eq!(embedder.model_id(), "nomic-embed-text");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        std::env::set_var("OLLAMA_ENDPOINT", "not a url");
        assert!(OllamaEmbedder::from_env().is_err());
        std::env::remove_var("OLLAMA_ENDPOINT");
    }
}
