//! Client side of the relay: one exchange at a time, streamed into a sink.
//!
//! A [`StreamingConsumer`] posts a prompt to the relay and reports the
//! accumulated response text to an [`ExchangeObserver`] after every read.
//! Starting a new exchange cancels the one in flight, so a consumer never has
//! more than one active exchange.
//!
//! ```no_run
//! use promptrelay::client::{ExchangeObserver, StreamingConsumer};
//! use std::time::Duration;
//!
//! struct Print;
//!
//! impl ExchangeObserver for Print {
//!     fn on_response_update(&self, text: &str) {
//!         println!("{text}");
//!     }
//!     fn on_loading_change(&self, _loading: bool) {}
//! }
//!
//! # async fn run() -> Result<(), promptrelay::client::ConsumerError> {
//! let consumer = StreamingConsumer::http("http://127.0.0.1:3000/api/ask", Duration::from_secs(10))?;
//! consumer.run_exchange("What is Rust?", None, &Print).await;
//! # Ok(())
//! # }
//! ```

mod decoder;
mod exchange;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;

pub use decoder::{DecodeError, Utf8StreamDecoder};
pub use exchange::{CancelReason, ExchangeHandle};
pub use transport::{AskPayload, ByteStream, HttpTransport, RelayTransport, TransportResponse};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on how much of an error body is read for its message.
const MAX_ERROR_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    #[error("request to relay failed: {0}")]
    Request(String),

    #[error("relay responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("relay response has no body")]
    MissingBody,

    #[error("reading relay response failed: {0}")]
    Read(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Receives the state of one exchange.
pub trait ExchangeObserver: Send + Sync {
    /// Called with the full accumulated text after every read, including the
    /// final flush at end of stream.
    fn on_response_update(&self, text: &str);

    fn on_loading_change(&self, loading: bool);

    /// Diagnostic sink for failures. Cancellation is never reported here.
    fn on_error(&self, error: &ConsumerError) {
        tracing::error!(error = %error, "exchange failed");
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The stream ended normally. Carries the final accumulated text.
    Completed(String),
    /// The exchange's own handle was cancelled.
    Cancelled(CancelReason),
    /// The exchange failed. The error was already passed to `on_error`.
    Failed(ConsumerError),
}

enum Stop {
    Cancelled,
    Failed(ConsumerError),
}

impl From<ConsumerError> for Stop {
    fn from(error: ConsumerError) -> Self {
        Stop::Failed(error)
    }
}

pub struct StreamingConsumer {
    transport: Arc<dyn RelayTransport>,
    stream_timeout: Duration,
    fatal_decode: bool,
    active: Mutex<Option<ExchangeHandle>>,
    next_id: AtomicU64,
}

impl StreamingConsumer {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            fatal_decode: false,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// A consumer talking to the relay at `endpoint` over HTTP.
    pub fn http(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self, ConsumerError> {
        let transport = HttpTransport::new(endpoint, connect_timeout)?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Fail the exchange with [`ConsumerError::Decode`] on invalid UTF-8
    /// instead of substituting U+FFFD.
    pub fn with_fatal_decode(mut self, fatal: bool) -> Self {
        self.fatal_decode = fatal;
        self
    }

    /// The handle of the exchange currently in flight, if any.
    pub fn active_handle(&self) -> Option<ExchangeHandle> {
        self.lock_active().clone()
    }

    /// Cancels the exchange in flight. Returns `false` when there was none.
    pub fn cancel_active(&self) -> bool {
        match self.lock_active().as_ref() {
            Some(handle) => {
                handle.cancel(CancelReason::Caller);
                true
            }
            None => false,
        }
    }

    /// Runs one exchange to completion, cancellation or failure.
    ///
    /// Never returns an error: failures go to [`ExchangeObserver::on_error`]
    /// and come back as [`ExchangeOutcome::Failed`]. Loading is reset and the
    /// active handle released on every exit path, including when this future
    /// is dropped.
    pub async fn run_exchange(
        &self,
        prompt: &str,
        previous_response: Option<&str>,
        observer: &dyn ExchangeObserver,
    ) -> ExchangeOutcome {
        let handle = self.begin();
        observer.on_loading_change(true);
        let _guard = ExchangeGuard {
            consumer: self,
            observer,
            id: handle.id(),
        };

        if handle.is_cancelled() {
            return ExchangeOutcome::Cancelled(cancel_reason(&handle));
        }

        let payload = AskPayload::new(prompt, previous_response);
        match self.drive(&handle, &payload, observer).await {
            Ok(text) => ExchangeOutcome::Completed(text),
            Err(Stop::Cancelled) => {
                tracing::debug!(exchange = handle.id(), reason = ?handle.cancel_reason(), "exchange cancelled");
                ExchangeOutcome::Cancelled(cancel_reason(&handle))
            }
            Err(Stop::Failed(error)) => {
                observer.on_error(&error);
                ExchangeOutcome::Failed(error)
            }
        }
    }

    /// Cancels whatever is in flight and registers a fresh handle. Both happen
    /// under one lock, before any I/O of the new exchange.
    fn begin(&self) -> ExchangeHandle {
        let handle = ExchangeHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            previous.cancel(CancelReason::Superseded);
        }
        *active = Some(handle.clone());
        handle
    }

    fn release(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|handle| handle.id() == id) {
            *active = None;
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ExchangeHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drive(
        &self,
        handle: &ExchangeHandle,
        payload: &AskPayload,
        observer: &dyn ExchangeObserver,
    ) -> Result<String, Stop> {
        let deadline = tokio::time::sleep(self.stream_timeout);
        tokio::pin!(deadline);

        let response = tokio::select! {
            biased;
            _ = handle.cancelled() => return Err(Stop::Cancelled),
            _ = &mut deadline => return Err(timed_out(handle)),
            opened = self.transport.open(payload) => opened?,
        };

        let status = response.status;
        let Some(mut body) = response.body else {
            if is_success(status) {
                return Err(ConsumerError::MissingBody.into());
            }
            return Err(status_error(status, &[]).into());
        };

        if !is_success(status) {
            let raw = tokio::select! {
                biased;
                _ = handle.cancelled() => return Err(Stop::Cancelled),
                _ = &mut deadline => return Err(timed_out(handle)),
                raw = read_limited(&mut body, MAX_ERROR_BODY) => raw?,
            };
            return Err(status_error(status, &raw).into());
        }

        let mut decoder = if self.fatal_decode {
            Utf8StreamDecoder::fatal()
        } else {
            Utf8StreamDecoder::new()
        };
        let mut accumulated = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = handle.cancelled() => return Err(Stop::Cancelled),
                _ = &mut deadline => return Err(timed_out(handle)),
                next = body.next() => next,
            };

            let (text, done) = match next {
                Some(chunk) => (decoder.decode(&chunk?), false),
                None => (decoder.finish(), true),
            };
            let text = text.map_err(ConsumerError::from)?;

            if handle.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            accumulated.push_str(&text);
            observer.on_response_update(&accumulated);

            if done {
                return Ok(accumulated);
            }
        }
    }
}

struct ExchangeGuard<'a> {
    consumer: &'a StreamingConsumer,
    observer: &'a dyn ExchangeObserver,
    id: u64,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.consumer.release(self.id);
        self.observer.on_loading_change(false);
    }
}

fn timed_out(handle: &ExchangeHandle) -> Stop {
    handle.cancel(CancelReason::Timeout);
    Stop::Cancelled
}

fn cancel_reason(handle: &ExchangeHandle) -> CancelReason {
    handle.cancel_reason().unwrap_or(CancelReason::Caller)
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

async fn read_limited(body: &mut ByteStream, limit: usize) -> Result<BytesMut, ConsumerError> {
    let mut raw = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let room = limit - raw.len();
        raw.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if raw.len() >= limit {
            break;
        }
    }
    Ok(raw)
}

/// Builds the error for a non-2xx response, preferring the relay's
/// `{"error": "..."}` message.
fn status_error(status: u16, raw: &[u8]) -> ConsumerError {
    let from_json = serde_json::from_slice::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_owned));

    let message = from_json.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(raw).trim().to_owned();
        if text.is_empty() {
            format!("HTTP {status}")
        } else {
            text
        }
    });

    ConsumerError::Status { status, message }
}
