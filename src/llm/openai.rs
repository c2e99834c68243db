//! OpenAI-compatible streaming chat-completions provider.
//!
//! Posts `{model, messages, stream: true}` to `{base_url}/chat/completions`
//! and turns the SSE reply into [`StreamChunk`]s, one per event, stopping at
//! the `[DONE]` sentinel.

use std::future;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::provider::{ChunkStream, CompletionProvider, CompletionRequest, StreamChunk};
use super::{ConversationTurn, ProviderError};

const DONE_SENTINEL: &str = "[DONE]";

/// Streaming provider for any endpoint speaking the OpenAI chat-completions
/// wire format.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
}

impl OpenAiCompatibleProvider {
    /// Builds the provider. Only connection setup is time-bounded: a
    /// completion may legitimately stream for minutes.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn stream_chat(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(request.api_key.expose())
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: api_error_message(&text).unwrap_or(text),
            });
        }

        tracing::debug!(model = %request.model, messages = request.messages.len(), "upstream stream opened");

        let chunks = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(e) if e.data.trim() == DONE_SENTINEL))
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(parse_chunk(&event.data)),
                    Err(e) => Some(Err(ProviderError::Stream(e.to_string()))),
                })
            });

        Ok(chunks.boxed())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationTurn],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Parses one SSE `data:` payload into a chunk.
fn parse_chunk(data: &str) -> Result<StreamChunk, ProviderError> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Parse(format!("failed to parse chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Stream(error_value_message(&error)));
    }

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content);
    Ok(StreamChunk::new(delta))
}

/// Pulls a human-readable message out of an error body such as
/// `{"error": {"message": "..."}}` or `{"error": "..."}`.
fn api_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("error").map(error_value_message)
}

fn error_value_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("upstream reported an error")
        .to_owned()
}
