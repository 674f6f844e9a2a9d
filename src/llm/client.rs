//! Streaming chat client for an Ollama-compatible endpoint.
//!
//! NDJSON over `/api/chat`, model introspection over `/api/show`. Two clocks
//! bound every request: a total wall-clock deadline and a per-chunk
//! inactivity watchdog. Transient failures retry with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChatBackend, ChatRequest, ChunkSink, LlmError, ModelInfo};
use crate::config::OllamaConfig;

const BACKOFF_CAP_SECS: u64 = 30;

#[derive(Clone)]
pub struct OllamaClient {
    host: String,
    api_key: Option<String>,
    total_timeout: Duration,
    inactivity_timeout: Duration,
    max_retries: u32,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Self {
        Self {
            host: config.host.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            total_timeout: Duration::from_secs(config.timeout_secs),
            inactivity_timeout: Duration::from_secs(config.stream_inactivity_timeout),
            max_retries: config.max_retries,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.host, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    async fn chat_once(
        &self,
        request: &ChatRequest,
        sink: &dyn ChunkSink,
    ) -> Result<String, LlmError> {
        let deadline = Instant::now() + self.total_timeout;

        let mut message = json!({
            "role": "user",
            "content": format!("{}\n{}", request.context, request.prompt),
        });
        if !request.images.is_empty() {
            message["images"] = json!(request.images);
        }
        let body = json!({
            "model": request.model,
            "messages": [message],
            "stream": true,
        });

        let response = tokio::time::timeout_at(
            deadline,
            self.request(reqwest::Method::POST, "/api/chat").json(&body).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, text));
        }

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut accumulated = String::new();

        loop {
            let now = Instant::now();
            let remaining = deadline
                .checked_duration_since(now)
                .ok_or(LlmError::Timeout)?;
            let window = remaining.min(self.inactivity_timeout);

            let next = match tokio::time::timeout(window, stream.next()).await {
                // Dropping the stream aborts the transfer at the transport layer.
                Err(_) if remaining <= self.inactivity_timeout => return Err(LlmError::Timeout),
                Err(_) => return Err(LlmError::StreamStalled),
                Ok(item) => item,
            };

            let bytes = match next {
                None => break,
                Some(Err(e)) => return Err(LlmError::Network(e.to_string())),
                Some(Ok(bytes)) => bytes,
            };

            pending.extend_from_slice(&bytes);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                match decode_chat_line(&line)? {
                    ChatEvent::Chunk(text) => {
                        if !text.is_empty() {
                            sink.on_chunk(&text);
                            accumulated.push_str(&text);
                        }
                    }
                    ChatEvent::Done { tail, eval_count } => {
                        if !tail.is_empty() {
                            sink.on_chunk(&tail);
                            accumulated.push_str(&tail);
                        }
                        debug!("Ollama stream done, eval_count={:?}", eval_count);
                        return Ok(accumulated);
                    }
                    ChatEvent::Empty => {}
                }
            }
        }

        // Stream closed without a done marker; keep whatever arrived.
        if accumulated.is_empty() {
            Err(LlmError::InvalidResponse(
                "stream ended without content".to_string(),
            ))
        } else {
            Ok(accumulated)
        }
    }
}

#[derive(Debug)]
enum ChatEvent {
    Chunk(String),
    /// Final frame; may still carry a content tail.
    Done { tail: String, eval_count: Option<u64> },
    Empty,
}

fn decode_chat_line(line: &[u8]) -> Result<ChatEvent, LlmError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(ChatEvent::Empty);
    }
    let data: Value = serde_json::from_str(text)
        .map_err(|e| LlmError::InvalidResponse(format!("bad NDJSON line: {e}")))?;

    if let Some(err) = data["error"].as_str() {
        return Err(LlmError::Api {
            status: 200,
            message: err.to_string(),
        });
    }

    let content = data["message"]["content"].as_str().unwrap_or("").to_string();
    if data["done"].as_bool() == Some(true) {
        return Ok(ChatEvent::Done {
            tail: content,
            eval_count: data["eval_count"].as_u64(),
        });
    }
    Ok(ChatEvent::Chunk(content))
}

fn classify_status(status: u16, retry_after: Option<u64>, body: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Unauthorized,
        429 => LlmError::RateLimited { retry_after },
        502 | 503 | 504 => LlmError::ServiceUnavailable { status },
        _ => {
            let message: String = body.chars().take(500).collect();
            LlmError::Api { status, message }
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// 1s, 2s, 4s, ... capped at 30s; a parseable server Retry-After wins.
fn backoff_delay(attempt: u32, retry_after: Option<u64>) -> Duration {
    if let Some(secs) = retry_after {
        return Duration::from_secs(secs.min(BACKOFF_CAP_SECS));
    }
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(BACKOFF_CAP_SECS)
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

fn extract_context_length(model_info: &Value) -> Option<u64> {
    let map = model_info.as_object()?;
    map.iter()
        .find(|(key, _)| key.ends_with(".context_length"))
        .and_then(|(_, v)| v.as_u64())
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn chat(&self, request: ChatRequest, sink: &dyn ChunkSink) -> Result<String, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.chat_once(&request, sink).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let retry_after = match &e {
                        LlmError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = backoff_delay(attempt, retry_after);
                    warn!(
                        "Ollama chat attempt {}/{} failed ({}); retrying in {:?}",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn introspect(&self, model: &str) -> Result<ModelInfo, LlmError> {
        let response = self
            .request(reqwest::Method::POST, "/api/show")
            .json(&json!({ "model": model }))
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(ModelInfo {
            name: model.to_string(),
            param_size: data["details"]["parameter_size"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            quantization: data["details"]["quantization_level"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            context_length: extract_context_length(&data["model_info"]),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let response = self
            .request(reqwest::Method::GET, "/api/tags")
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let Some(models) = data["models"].as_array() else {
            return Err(LlmError::InvalidResponse("missing models array".to_string()));
        };

        let mut out = Vec::new();
        for model in models {
            let Some(name) = model["name"].as_str() else {
                continue;
            };
            // /api/tags omits the context window; fill it from /api/show.
            let context_length = self
                .introspect(name)
                .await
                .ok()
                .and_then(|info| info.context_length);
            out.push(ModelInfo {
                name: name.to_string(),
                param_size: model["details"]["parameter_size"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                quantization: model["details"]["quantization_level"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                context_length,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat_line_chunk() {
        let line = br#"{"message":{"content":"Hel"},"done":false}"#;
        match decode_chat_line(line).unwrap() {
            ChatEvent::Chunk(text) => assert_eq!(text, "Hel"),
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn test_decode_chat_line_done() {
        let line = br#"{"message":{"content":""},"done":true,"eval_count":42}"#;
        match decode_chat_line(line).unwrap() {
            ChatEvent::Done { tail, eval_count } => {
                assert!(tail.is_empty());
                assert_eq!(eval_count, Some(42));
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn test_decode_chat_line_blank_and_error() {
        assert!(matches!(decode_chat_line(b"  \n").unwrap(), ChatEvent::Empty));
        let err = decode_chat_line(br#"{"error":"model not found"}"#).unwrap_err();
        assert!(matches!(err, LlmError::Api { .. }));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(401, None, String::new()),
            LlmError::Unauthorized
        ));
        assert!(matches!(
            classify_status(429, Some(7), String::new()),
            LlmError::RateLimited {
                retry_after: Some(7)
            }
        ));
        assert!(matches!(
            classify_status(503, None, String::new()),
            LlmError::ServiceUnavailable { status: 503 }
        ));
        assert!(matches!(
            classify_status(400, None, "bad request".to_string()),
            LlmError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0, None), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, None), Duration::from_secs(30));
        assert_eq!(backoff_delay(0, Some(12)), Duration::from_secs(12));
        assert_eq!(backoff_delay(0, Some(900)), Duration::from_secs(30));
    }

    #[test]
    fn test_extract_context_length() {
        let info = json!({
            "llama.attention.head_count": 32,
            "llama.context_length": 131072
        });
        assert_eq!(extract_context_length(&info), Some(131072));
        assert_eq!(extract_context_length(&json!({})), None);
    }
}
