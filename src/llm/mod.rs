//! LLM access: the [`ChatBackend`] seam plus the Ollama client behind it.

pub mod client;

pub use client::OllamaClient;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Total wall-clock budget exceeded; the in-flight request was aborted.
    #[error("Ollama request timed out")]
    Timeout,
    /// No chunk arrived within the inactivity window.
    #[error("Ollama stream stalled")]
    StreamStalled,
    #[error("Ollama rejected the request (unauthorized)")]
    Unauthorized,
    #[error("Ollama rate limited the request")]
    RateLimited { retry_after: Option<u64> },
    #[error("Ollama unavailable (status {status})")]
    ServiceUnavailable { status: u16 },
    #[error("Network error talking to Ollama: {0}")]
    Network(String),
    #[error("Ollama request failed (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid response from Ollama: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Only transient transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::ServiceUnavailable { .. }
                | LlmError::Network(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub param_size: String,
    pub quantization: String,
    pub context_length: Option<u64>,
}

/// One streaming chat turn. The user message content is
/// `context + "\n" + prompt`; images are base64 blobs attached to it.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub context: String,
    pub prompt: String,
    pub images: Vec<String>,
}

/// Receives chunks as they stream in. Implementations must be cheap; the
/// client calls this inline between reads.
pub trait ChunkSink: Send + Sync {
    fn on_chunk(&self, chunk: &str);
}

pub struct NullSink;

impl ChunkSink for NullSink {
    fn on_chunk(&self, _chunk: &str) {}
}

/// The orchestrator's view of the LLM. Production uses [`OllamaClient`];
/// loop tests script this trait instead.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Streaming chat: every chunk is forwarded to `sink`, the accumulated
    /// text is returned after the final flush.
    async fn chat(&self, request: ChatRequest, sink: &dyn ChunkSink) -> Result<String, LlmError>;

    async fn introspect(&self, model: &str) -> Result<ModelInfo, LlmError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;

    /// One-shot completion for internal tasks (tool-context condensation,
    /// fallback summaries).
    async fn completion(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        self.chat(
            ChatRequest {
                model: model.to_string(),
                context: String::new(),
                prompt: prompt.to_string(),
                images: Vec::new(),
            },
            &NullSink,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::ServiceUnavailable { status: 503 }.is_retryable());
        assert!(LlmError::Network("reset".into()).is_retryable());

        assert!(!LlmError::Unauthorized.is_retryable());
        assert!(!LlmError::Timeout.is_retryable());
        assert!(!LlmError::StreamStalled.is_retryable());
        assert!(!LlmError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }
}
