//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive), streaming responses
//! written with chunked transfer encoding, and graceful shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::{LAST_CHUNK, Response, encode_chunk},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (1 MiB).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// How long in-flight connections get to finish once shutdown starts, unless
/// overridden with [`Server::drain_timeout`].
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use promptrelay::server::Server;
/// use promptrelay::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    drain_timeout: Duration,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets how long [`run_until`](Self::run_until) waits for in-flight
    /// connections after the shutdown signal fires.
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// Runs until the process is terminated or an unrecoverable listener error
    /// occurs. See [`run_until`](Self::run_until) for graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), but stops accepting once `shutdown` resolves
    /// and then waits up to the drain timeout for open connections (including
    /// streams still being relayed) before returning. Idle keep-alive
    /// connections are closed at once. Connections still open after the
    /// timeout are aborted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();
        let stop = CancellationToken::new();
        info!(address = %self.local_addr, "promptrelay listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open = connections.len(), "shutdown requested, no longer accepting");
                    stop.cancel();
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "connection accepted");
                    let handler = Arc::clone(&handler);
                    let stop = stop.clone();

                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, handler, stop).await {
                            warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!("all connections drained"),
            Err(_) => {
                warn!(
                    open = connections.len(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "drain timeout reached, aborting open connections"
                );
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

/// How a response write ended.
#[derive(Debug, PartialEq, Eq)]
enum Written {
    Complete,
    /// The peer hung up before the body finished; the body was dropped.
    PeerClosed,
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`. A streaming body that fails midway closes the
/// connection without the terminating chunk.
///
/// Once `stop` fires, a connection waiting for its next request closes
/// right away and one with a response in flight closes after it.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    stop: CancellationToken,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // A pipelined request may already be complete in the buffer.
        if buf.is_empty() || matches!(Request::parse(&buf), Err(RequestError::Incomplete)) {
            let bytes_read = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(peer = %peer_addr, "server shutting down, closing idle connection");
                    break;
                }
                read = stream.read_buf(&mut buf) => read?,
            };
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // `parse` already validated the header, so this cannot fail here.
        let content_length = request.content_length().ok().flatten().unwrap_or(0);
        if content_length > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Wait for the full body to arrive.
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "peer closed mid-body");
                break;
            }
            continue;
        }

        let keep_alive = request.is_keep_alive();
        // HTTP/1.0 peers cannot decode chunked bodies.
        let chunked = request.version() != 0;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut response = handler(request).await;
        if !keep_alive || stop.is_cancelled() || (!chunked && response.is_streaming()) {
            response = response.keep_alive(false);
        }
        let keep_alive = response.is_keep_alive();

        // Drop the consumed request bytes; a pipelined request read while the
        // response streams lands behind them.
        let _ = buf.split_to(total_needed);

        let written = write_response(&mut stream, peer_addr, response, chunked, &mut buf).await?;
        if written == Written::PeerClosed {
            break;
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            stream.shutdown().await?;
            break;
        }
    }

    Ok(())
}

/// Writes one response. Streaming bodies are forwarded chunk by chunk, with a
/// flush after each, so nothing is held back beyond what the socket buffers.
///
/// While waiting on the body the socket is also read, so a peer that hangs up
/// is noticed even when the body stalls. Bytes that arrive meanwhile are kept
/// in `buf` for the next request.
async fn write_response(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    response: Response,
    chunked: bool,
    buf: &mut BytesMut,
) -> Result<Written, std::io::Error> {
    let (head, body) = if chunked {
        response.into_wire()
    } else {
        response.into_wire_close_delimited()
    };
    stream.write_all(&head).await?;
    stream.flush().await?;

    let Some(mut body) = body else {
        return Ok(Written::Complete);
    };

    let mut chunks = 0usize;
    loop {
        let item = tokio::select! {
            item = body.next() => item,
            read = stream.read_buf(buf), if buf.len() <= MAX_REQUEST_SIZE => match read {
                Ok(0) => {
                    debug!(peer = %peer_addr, chunks, "peer closed mid-stream, dropping body");
                    return Ok(Written::PeerClosed);
                }
                Ok(_) => continue,
                Err(e) => return Err(e),
            },
        };
        let Some(item) = item else { break };

        match item {
            Ok(data) if data.is_empty() => continue,
            Ok(data) if chunked => {
                stream.write_all(&encode_chunk(&data)).await?;
                stream.flush().await?;
                chunks += 1;
            }
            Ok(data) => {
                stream.write_all(&data).await?;
                stream.flush().await?;
                chunks += 1;
            }
            Err(e) => {
                // Partial output was already delivered; closing without the
                // last chunk is how the peer learns the body is incomplete.
                warn!(peer = %peer_addr, chunks, error = %e, "stream aborted mid-body");
                return Err(e);
            }
        }
    }

    if chunked {
        stream.write_all(LAST_CHUNK).await?;
        stream.flush().await?;
    }
    debug!(peer = %peer_addr, chunks, "stream complete");
    Ok(Written::Complete)
}
