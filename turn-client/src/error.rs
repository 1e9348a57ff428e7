use std::io;
use stun_rs::TransactionId;
use thiserror::Error;

/// Errors surfaced by the TURN client, its transactions and its allocations.
#[derive(Debug, Error)]
pub enum TurnError {
    /// No response arrived before the retransmission schedule was exhausted.
    #[error("transaction timed out")]
    Timeout,
    /// The client was closed while the request was outstanding.
    #[error("transaction cancelled")]
    Cancelled,
    /// The server demands authentication and no credentials are configured.
    #[error("server requires authentication and no credentials are configured")]
    AuthRequired,
    /// The server answered 438 (Stale Nonce) to a request already retried with a fresh nonce.
    #[error("stale nonce received after re-authentication")]
    StaleCredentialsExhausted,
    /// The requested relay transport does not match what the server or control connection supports.
    #[error("allocation mismatch: {0}")]
    AllocationMismatch(String),
    /// The underlying transport is gone.
    #[error("transport closed")]
    TransportClosed,
    /// A transaction with the same identifier is already outstanding.
    #[error("duplicate {0}")]
    DuplicateTransaction(TransactionId),
    /// The client already owns a live allocation.
    #[error("allocation already exists")]
    AlreadyAllocated,
    /// The allocation has been closed.
    #[error("allocation closed")]
    AllocationClosed,
    /// `listen` was called more than once.
    #[error("client is already listening")]
    AlreadyListening,
    /// A request was issued before `listen`.
    #[error("client is not listening")]
    NotListening,
    /// The client was built without a transport.
    #[error("no transport provided")]
    NoTransport,
    /// The server needed for the operation was not configured.
    #[error("no {0} server configured")]
    NoServer(&'static str),
    /// Error response not handled internally.
    #[error("error response {code}: {reason}")]
    ErrorResponse { code: u16, reason: String },
    /// Malformed or semantically invalid message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// stun-rs failed to encode, decode or build an attribute.
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TurnError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TurnError::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TurnError::Cancelled)
    }

    pub(crate) fn codec<E: std::fmt::Display>(e: E) -> Self {
        TurnError::Codec(e.to_string())
    }
}

impl From<stun_rs::StunError> for TurnError {
    fn from(e: stun_rs::StunError) -> Self {
        TurnError::codec(e)
    }
}

pub type Result<T> = std::result::Result<T, TurnError>;
