//! Error types for the SignalR client core.

use thiserror::Error;

/// Errors produced by the connection and transport layers.
#[derive(Debug, Error)]
pub enum SignalRError {
    /// The operation is not permitted in the current connection or
    /// transport state (e.g. send before open, double start).
    #[error("operation not permitted in the current state")]
    InvalidState,

    /// The negotiate response was missing, ill-formed, or semantically
    /// unusable (e.g. an empty transport list).
    #[error("invalid negotiation response: {0}")]
    InvalidNegotiationResponse(String),

    /// An endpoint answered with a non-success HTTP status.
    #[error("HTTP request failed with status code {0}")]
    WebError(u16),

    /// A stop raced an in-flight start; the start is abandoned.
    #[error("connection is being closed")]
    ConnectionIsBeingClosed,

    /// A hub method invocation failed. Surfaced by the layer above through
    /// the same channel as connection errors.
    #[error("hub invocation error: {0}")]
    HubInvocationError(String),

    /// The remote endpoint violated the hub protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A requested operation cannot be carried out (e.g. no advertised
    /// transport is supported).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An HTTP request hit the client-side timeout.
    #[error("request timed out")]
    Timeout,

    /// An underlying network error, message preserved verbatim.
    #[error("HTTP transport error: {0}")]
    Http(String),
}

/// A specialized [`Result`] type for SignalR client operations.
pub type Result<T> = std::result::Result<T, SignalRError>;
