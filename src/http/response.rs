//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them for transmission over TCP. A response body is either
//! fully buffered ([`Body::Full`], sent with `Content-Length`) or a stream of
//! chunks ([`Body::Stream`], sent with `Transfer-Encoding: chunked` and
//! flushed chunk by chunk).

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use serde::Serialize;

use super::{Headers, StatusCode};

/// A boxed stream of body chunks.
///
/// An `Err` item aborts the response: the terminating zero-length chunk is
/// never written, so the peer sees a truncated body rather than a clean end.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// The zero-length chunk that terminates a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Response payload.
pub enum Body {
    /// A complete body, sent with `Content-Length`.
    Full(Bytes),
    /// An incremental body, sent with chunked transfer encoding.
    Stream(BodyStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use promptrelay::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Full(Bytes::new()),
            keep_alive: true,
        }
    }

    /// Builds a JSON response from any serializable value.
    ///
    /// Serialization failures degrade to a plain `500`.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError).body("Internal Server Error")
            }
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware that receive a
    /// `Response` from downstream and decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streaming body. Each item is written as one HTTP chunk and
    /// flushed before the next item is polled.
    #[must_use]
    pub fn stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.body = Body::Stream(Box::pin(stream));
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far (automatic framing headers excluded).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the body is a stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Returns `true` if the connection stays open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response into its HTTP/1.1 wire form.
    ///
    /// For a [`Body::Full`] the returned buffer holds the head and the body and
    /// the stream is `None`. For a [`Body::Stream`] the buffer holds only the
    /// head; the caller frames every item with [`encode_chunk`] and finishes
    /// with [`LAST_CHUNK`].
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if a fixed body is non-empty
    ///   and no `Content-Type` header was set.
    /// - `Content-Length: <n>` for fixed bodies, `Transfer-Encoding: chunked`
    ///   for streams.
    /// - `Connection: keep-alive` or `Connection: close`, replacing any
    ///   `Connection` header set by the handler.
    pub fn into_wire(self) -> (BytesMut, Option<BodyStream>) {
        self.encode(true)
    }

    /// Like [`into_wire`](Self::into_wire), but for peers that cannot decode
    /// chunked bodies (HTTP/1.0). A stream is sent raw, with no framing
    /// header, and ends when the connection closes, so `Connection: close`
    /// is forced.
    pub fn into_wire_close_delimited(self) -> (BytesMut, Option<BodyStream>) {
        self.keep_alive(false).encode(false)
    }

    fn encode(mut self, chunked: bool) -> (BytesMut, Option<BodyStream>) {
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);
        self.headers.remove("content-length");
        self.headers.remove("transfer-encoding");

        let (framing, fixed, stream) = match self.body {
            Body::Full(body) => {
                if !body.is_empty() && !self.headers.contains("content-type") {
                    self.headers
                        .insert("Content-Type", "text/plain; charset=utf-8");
                }
                (format!("Content-Length: {}\r\n", body.len()), body, None)
            }
            Body::Stream(stream) => {
                let framing = if chunked {
                    "Transfer-Encoding: chunked\r\n".to_owned()
                } else {
                    String::new()
                };
                (framing, Bytes::new(), Some(stream))
            }
        };

        let estimated_size = 128 + self.headers.len() * 64 + fixed.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Framing is always the last header before the blank line
        buf.put(framing.as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(fixed);

        (buf, stream)
    }

    /// Serializes the response, dropping any body stream.
    ///
    /// Only meaningful for fixed bodies; for a streaming response this yields
    /// just the head.
    pub fn into_bytes(self) -> BytesMut {
        self.into_wire().0
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Frames `data` as one HTTP/1.1 chunk. `data` must not be empty: a
/// zero-length chunk terminates the body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    debug_assert!(!data.is_empty(), "empty chunk would terminate the body");
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    buf.put(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}
