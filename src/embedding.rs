use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// Embedding backend seam. OpenAI, Ollama, a local model, whatever.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// Dimensionality of the vectors this provider produces.
    fn dimension(&self) -> usize;

    /// Model name, e.g. `nomic-embed-text`.
    fn model(&self) -> &str;

    /// Provider family, e.g. `ollama`.
    fn provider(&self) -> &str;

    /// Identity of the embedding space. Vectors from different fingerprints
    /// are incomparable; the index discards itself on mismatch.
    fn fingerprint(&self) -> EmbedderFingerprint {
        EmbedderFingerprint {
            model: self.model().to_string(),
            provider: self.provider().to_string(),
            dimension: self.dimension(),
        }
    }
}

/// Persisted identity of an embedding space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedderFingerprint {
    pub model: String,
    pub provider: String,
    pub dimension: usize,
}

// ---------------------------------------------------------------------------
// HTTP embedder
// ---------------------------------------------------------------------------

/// HTTP embedding client for local Ollama-compatible servers. Batches a
/// whole request through `/api/embed` and refuses any reply whose vector
/// count or dimensionality disagrees with the configured fingerprint; a
/// silently wrong dimension would poison every cosine score in the index.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

/// Only the embeddings matter from the reply; everything else the server
/// sends is ignored.
#[derive(Deserialize)]
struct EmbedReply {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    /// `dimension` is a promise about the model, not a request parameter:
    /// the server is not asked for it, replies are checked against it.
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint())
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding(format!("embed endpoint unreachable: {e}")))?;

        // Keep the raw body around: on a non-2xx status it IS the error
        // detail, and on success it still has to survive a JSON parse.
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RetrievalError::Embedding(format!("embed reply unreadable: {e}")))?;
        if !status.is_success() {
            return Err(RetrievalError::Embedding(format!(
                "embed endpoint refused ({status}): {body}"
            )));
        }

        let reply: EmbedReply = serde_json::from_str(&body)
            .map_err(|e| RetrievalError::Embedding(format!("malformed embed reply: {e}")))?;

        if reply.embeddings.len() != texts.len() {
            return Err(RetrievalError::Embedding(format!(
                "asked for {} vectors, server sent {}",
                texts.len(),
                reply.embeddings.len()
            )));
        }
        for (n, vector) in reply.embeddings.iter().enumerate() {
            if vector.len() != self.dimension {
                return Err(RetrievalError::Embedding(format!(
                    "vector {n} is {}-dimensional, {} configured for {}",
                    vector.len(),
                    self.model,
                    self.dimension
                )));
            }
        }
        Ok(reply.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "ollama"
    }
}
