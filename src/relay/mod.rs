//! The relay endpoint: validate a prompt, open an upstream streaming
//! completion, and re-emit its text deltas as a chunked event stream.
//!
//! Everything that can go wrong before the first byte of the stream is
//! converted into a JSON `{"error": ...}` response (`400` for bad prompts,
//! `500` otherwise). Once the stream has started, an upstream failure ends
//! the body abruptly; it is never retried, because the client has no way to
//! tell a resend from duplicated output.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::{Context, REQUEST_ID_HEADER};
use crate::llm::{ChunkStream, CompletionProvider, CompletionRequest, DEFAULT_MODEL, ProviderError, conversation};
use crate::router::Router;
use crate::{Response, StatusCode};

mod credential;
mod request;

pub use credential::{CredentialSource, EnvCredential, StaticCredential};
pub use request::{RelayRequest, ValidationRules};

/// Why a relay request produced no stream.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("upstream API credential is not configured")]
    MissingCredential,

    #[error("malformed request body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Upstream(#[from] ProviderError),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BadRequest,
            Self::MissingCredential | Self::Malformed(_) | Self::Upstream(_) => {
                StatusCode::InternalServerError
            }
        }
    }

    /// The message shown to the client. Internal details stay in the logs.
    pub fn public_message(&self) -> &str {
        match self {
            Self::Validation(message) => message,
            Self::MissingCredential => "Server is missing the upstream API credential.",
            Self::Malformed(_) | Self::Upstream(_) => "Failed to process request",
        }
    }

    pub fn into_response(self) -> Response {
        Response::json(
            self.status(),
            &ErrorBody {
                error: self.public_message(),
            },
        )
    }
}

/// Server-side half of an exchange.
///
/// The provider and the credential source are injected so the handler can run
/// against fakes.
pub struct RelayHandler {
    provider: Arc<dyn CompletionProvider>,
    credentials: Arc<dyn CredentialSource>,
    model: String,
    rules: ValidationRules,
}

impl RelayHandler {
    pub fn new(provider: Arc<dyn CompletionProvider>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            provider,
            credentials,
            model: DEFAULT_MODEL.to_owned(),
            rules: ValidationRules::default(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// Registers the handler as `POST path` on `router`.
    pub fn mount(self: Arc<Self>, router: &mut Router, path: &str) {
        router.post(path, move |ctx: Context| {
            let relay = Arc::clone(&self);
            async move { relay.handle(ctx).await }
        });
    }

    /// Handles one relay request. Never fails: errors become JSON responses.
    pub async fn handle(&self, ctx: Context) -> Response {
        match self.open_stream(&ctx).await {
            Ok(response) => response,
            Err(e) => {
                let request_id = ctx.request_id();
                match &e {
                    RelayError::Validation(message) => {
                        info!(%request_id, reason = %message, "rejected prompt");
                    }
                    other => error!(%request_id, error = %other, "relay request failed"),
                }
                e.into_response()
            }
        }
    }

    async fn open_stream(&self, ctx: &Context) -> Result<Response, RelayError> {
        let request = RelayRequest::from_body(ctx.request().body(), &self.rules)?;
        let api_key = self
            .credentials
            .api_key()
            .ok_or(RelayError::MissingCredential)?;

        let messages = conversation(&request.prompt, request.previous_response.as_deref());
        info!(
            request_id = %ctx.request_id(),
            provider = self.provider.name(),
            model = %self.model,
            messages = messages.len(),
            "opening upstream stream"
        );

        let upstream = self
            .provider
            .stream_chat(CompletionRequest {
                model: self.model.clone(),
                messages,
                api_key,
            })
            .await?;

        Ok(Response::new(StatusCode::Ok)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache, no-transform")
            .header("Connection", "keep-alive")
            .header("X-Accel-Buffering", "no")
            .header(REQUEST_ID_HEADER, ctx.request_id())
            .stream(relay_body(upstream, ctx.request_id().to_owned())))
    }
}

/// Re-encodes upstream chunks as raw text fragments, in order, one body
/// chunk per non-empty delta.
fn relay_body(mut upstream: ChunkStream, request_id: String) -> impl Stream<Item = io::Result<Bytes>> {
    async_stream::stream! {
        let mut fragments = 0usize;
        let mut bytes = 0usize;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    let text = chunk.into_text();
                    if text.is_empty() {
                        continue;
                    }
                    fragments += 1;
                    bytes += text.len();
                    yield Ok(Bytes::from(text));
                }
                Err(e) => {
                    warn!(%request_id, fragments, bytes, error = %e, "upstream failed mid-stream");
                    yield Err(io::Error::other(e));
                    return;
                }
            }
        }

        info!(%request_id, fragments, bytes, "relay stream finished");
    }
}
