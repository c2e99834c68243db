//! Conversation turns, the completion provider seam and an
//! OpenAI-compatible streaming client.

use thiserror::Error;

mod message;
pub mod openai;
mod provider;

pub use message::{ConversationTurn, Role, conversation};
pub use openai::OpenAiCompatibleProvider;
pub use provider::{ApiKey, ChunkStream, CompletionProvider, CompletionRequest, StreamChunk};

/// Model used when the configuration does not name one.
pub const DEFAULT_MODEL: &str = "c1/openai/gpt-5/v-20250915";

/// Errors from completion providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error("upstream sent an unreadable chunk: {0}")]
    Parse(String),
}
