//! # SignalR Client
//!
//! Core transport-and-connection client for the SignalR protocol: the
//! negotiate handshake, transport selection (WebSockets or HTTP
//! long-polling), the connection state machine, and the concurrency
//! discipline tying them together.
//!
//! ## Features
//!
//! - **Negotiation** — decodes every negotiate response shape (error,
//!   redirect, v0/v1 payload) into one sum type with precise key-path
//!   diagnostics, and follows redirect chains with bearer handover
//! - **Transports** — WebSockets via `tokio-tungstenite` (default
//!   `transport-websocket` feature) and HTTP long-polling via a pluggable
//!   [`HttpClient`]
//! - **Delegate-driven** — lifecycle and data callbacks arrive in FIFO
//!   order through [`HttpConnectionDelegate`]; transports and the
//!   connection hold their delegates weakly, so callbacks never keep an
//!   abandoned connection alive
//! - **Predictable shutdown** — `stop` serializes behind an in-flight
//!   `start`, and exactly one terminal callback fires per connection
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let connection = HttpConnection::new(
//!     Url::parse("https://example.com/chat")?,
//!     HttpConnectionOptions::new(),
//! );
//! connection.set_delegate(Arc::downgrade(&my_delegate));
//! connection.start().await;
//! // ... connection_did_open / connection_did_receive_data fire on the delegate
//! connection.stop(None).await;
//! ```

pub mod connection;
pub mod error;
pub mod http;
pub mod negotiate;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{
    AccessTokenProvider, ConnectionState, HttpConnection, HttpConnectionDelegate,
    HttpConnectionOptions,
};
pub use error::{Result, SignalRError};
pub use http::{DefaultHttpClient, HttpClient, HttpResponse};
pub use negotiate::{CodingPath, NegotiateDecodeError, NegotiationResponse, PathSegment};
pub use transport::{
    TransferFormat, Transport, TransportDelegate, TransportDescription, TransportKind,
};
pub use transports::{DefaultTransportFactory, LongPollingTransport, TransportFactory};
#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn mutex_lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
