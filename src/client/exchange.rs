//! Handles for in-flight exchanges.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why an exchange was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer exchange on the same consumer replaced it.
    Superseded,
    /// The caller cancelled it explicitly.
    Caller,
    /// The stream did not finish within the configured timeout.
    Timeout,
}

/// One in-flight exchange. Clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    id: u64,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl ExchangeHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cancellation. Only the first reason is kept; later calls are
    /// no-ops. Returns immediately: the exchange notices at its next
    /// suspension point.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once the exchange is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
