//! The seam between the relay and whatever produces completions.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{ConversationTurn, ProviderError};

/// Upstream credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// A streaming chat-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ConversationTurn>,
    pub api_key: ApiKey,
}

/// One unit of upstream output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    delta: Option<String>,
}

impl StreamChunk {
    pub fn new(delta: Option<String>) -> Self {
        Self { delta }
    }

    /// A chunk carrying `text`.
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::new(Some(text.into()))
    }

    /// The chunk's text fragment, or `""` when it carries none
    /// (role announcements, finish markers, keep-alives).
    pub fn text(&self) -> &str {
        self.delta.as_deref().unwrap_or("")
    }

    pub fn into_text(self) -> String {
        self.delta.unwrap_or_default()
    }
}

/// Ordered upstream chunks for one completion.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Something that can open a streaming chat completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Open the completion. Errors returned here happen before any output
    /// exists; errors yielded by the stream happen mid-output.
    async fn stream_chat(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError>;
}
