//! Chat model integration
//!
//! - **ollama**: streaming client for an Ollama-compatible chat server
//! - **phrases**: cuts a token stream into sentence-sized chunks for speech
//! - **directives**: finds `[IMAGE: ...]` requests and other bracketed tags
//! - **prompts**: system prompt assembly and the image prompt optimizer

pub mod directives;
pub mod ollama;
pub mod phrases;
pub mod prompts;

pub use directives::{strip_image_directives, strip_tags, DirectiveScanner, ScanOutput};
pub use ollama::OllamaClient;
pub use phrases::PhraseChunker;

use crate::engine::Lifecycle;
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// Role of a message sent to the chat model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One chat completion request. `model` and `host` override the engine's
/// configured defaults for this request only.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip)]
    pub host: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Stream of reply text deltas
pub type DeltaStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ChatModel: Lifecycle {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<DeltaStream>;

    /// Run a request to completion
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let mut stream = self.stream_chat(request).await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta?);
        }
        Ok(text)
    }

    async fn list_models(&self, host: Option<&str>) -> Result<Vec<String>>;
}
