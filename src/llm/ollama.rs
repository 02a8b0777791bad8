//! Ollama chat client
//!
//! `POST /api/chat` with `stream: true` answers with newline-delimited JSON,
//! one `{"message": {"content": ...}, "done": bool}` object per line.

use super::{ChatModel, ChatRequest, DeltaStream};
use crate::config::LlmSettings;
use crate::engine::remote::error_body;
use crate::engine::{Device, Lifecycle};
use crate::{ParleyError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A stream that sends nothing for this long is treated as dropped
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [super::ChatMessage],
    stream: bool,
    keep_alive: &'a str,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    size_vram: Option<u64>,
}

/// One decoded NDJSON line
#[derive(Debug, PartialEq)]
enum Decoded {
    Delta(String),
    /// Last chunk, carrying trailing content
    Final(String),
    Done,
    Error(String),
    Skip,
}

/// Splits a byte stream into complete lines and decodes chat chunks
#[derive(Default)]
struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.push(Self::decode_line(&line));
        }
        out
    }

    fn finish(&mut self) -> Option<Decoded> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(Self::decode_line(&line))
    }

    fn decode_line(line: &[u8]) -> Decoded {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Decoded::Skip;
        }
        match serde_json::from_str::<ChatChunk>(text) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    return Decoded::Error(error);
                }
                if chunk.done {
                    return match chunk.message {
                        Some(m) if !m.content.is_empty() => Decoded::Final(m.content),
                        _ => Decoded::Done,
                    };
                }
                match chunk.message {
                    Some(m) if !m.content.is_empty() => Decoded::Delta(m.content),
                    _ => Decoded::Skip,
                }
            }
            Err(e) => {
                trace!("Skipping undecodable line ({}): {}", e, text);
                Decoded::Skip
            }
        }
    }
}

pub struct OllamaClient {
    http: reqwest::Client,
    host: String,
    model: String,
    keep_alive: String,
    memory_estimate_mb: u64,
}

impl OllamaClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ParleyError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            host: settings.host.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            keep_alive: settings.keep_alive.clone(),
            memory_estimate_mb: settings.memory_estimate_mb,
        })
    }

    fn base<'a>(&'a self, host: Option<&'a str>) -> &'a str {
        host.map(|h| h.trim_end_matches('/')).unwrap_or(&self.host)
    }

    async fn set_keep_alive(&self, keep_alive: &str) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [],
            "keep_alive": keep_alive,
        });
        let response = self
            .http
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ParleyError::HttpError(error_body(response).await));
        }
        Ok(())
    }

    /// Resident size of our model from `/api/ps`, preferring VRAM size
    async fn resident_memory_mb(&self) -> Option<u64> {
        let response = self
            .http
            .get(format!("{}/api/ps", self.host))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        let running: TagsResponse = response.json().await.ok()?;
        let family = self.model.split(':').next().unwrap_or(&self.model);
        running
            .models
            .iter()
            .find(|m| m.name.split(':').next() == Some(family))
            .and_then(|m| m.size_vram.filter(|v| *v > 0).or(m.size))
            .map(|bytes| bytes / (1024 * 1024))
    }
}

#[async_trait]
impl Lifecycle for OllamaClient {
    fn name(&self) -> String {
        self.model.clone()
    }

    fn device(&self) -> Device {
        Device::resolve("auto", &self.host)
    }

    async fn load(&self) -> Result<u64> {
        // An empty chat with keep_alive loads the model and returns immediately
        self.set_keep_alive(&self.keep_alive).await?;
        let memory = self.resident_memory_mb().await.unwrap_or(self.memory_estimate_mb);
        debug!("Ollama model {} resident (~{} MB)", self.model, memory);
        Ok(memory)
    }

    async fn unload(&self) -> Result<()> {
        self.set_keep_alive("0").await
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!("{}/api/chat", self.base(request.host.as_deref()));
        let payload = ChatPayload {
            model,
            messages: &request.messages,
            stream: true,
            keep_alive: &self.keep_alive,
        };

        debug!("Streaming chat from {} ({} messages)", url, request.messages.len());
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ParleyError::GenerationError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ParleyError::GenerationError(error_body(response).await));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = NdjsonDecoder::default();
            loop {
                let next = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(ParleyError::GenerationError(format!(
                            "Chat stream idle for {}s", STREAM_IDLE_TIMEOUT.as_secs()
                        )));
                        return;
                    }
                };

                let decoded = match next {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        yield Err(ParleyError::GenerationError(format!("Chat stream dropped: {}", e)));
                        return;
                    }
                    None => match decoder.finish() {
                        Some(Decoded::Final(text)) => {
                            yield Ok(text);
                            return;
                        }
                        Some(Decoded::Done) => return,
                        _ => {
                            yield Err(ParleyError::GenerationError(
                                "Chat stream ended before completion".into(),
                            ));
                            return;
                        }
                    },
                };

                for item in decoded {
                    match item {
                        Decoded::Delta(text) => yield Ok(text),
                        Decoded::Final(text) => {
                            yield Ok(text);
                            return;
                        }
                        Decoded::Done => return,
                        Decoded::Error(message) => {
                            yield Err(ParleyError::GenerationError(message));
                            return;
                        }
                        Decoded::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn list_models(&self, host: Option<&str>) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base(host)))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("Listing models failed: {}", response.status());
            return Err(ParleyError::HttpError(error_body(response).await));
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_across_pushes() {
        let mut decoder = NdjsonDecoder::default();
        let first = decoder.push(br#"{"message":{"content":"Hel"},"done":false}
{"message":{"cont"#);
        assert_eq!(first, vec![Decoded::Delta("Hel".into())]);

        let second = decoder.push(b"ent\":\"lo\"},\"done\":false}\n{\"done\":true}\n");
        assert_eq!(second, vec![Decoded::Delta("lo".into()), Decoded::Done]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_reports_errors_and_skips_noise() {
        let mut decoder = NdjsonDecoder::default();
        let items = decoder.push(b"\nnot json\n{\"error\":\"model not found\"}\n");
        assert_eq!(
            items,
            vec![Decoded::Skip, Decoded::Skip, Decoded::Error("model not found".into())]
        );
    }

    #[test]
    fn test_decoder_unterminated_final_line() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"message":{"content":"bye"},"done":true}"#).is_empty());
        assert_eq!(decoder.finish(), Some(Decoded::Final("bye".into())));
    }

    #[test]
    fn test_request_host_override() {
        let client = OllamaClient::new(&LlmSettings::default()).unwrap();
        assert_eq!(client.base(None), "http://localhost:11434");
        assert_eq!(client.base(Some("http://gpu:11434/")), "http://gpu:11434");
        assert_eq!(client.device(), Device::Accelerator);
    }
}
