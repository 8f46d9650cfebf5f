//! Transport abstraction for the SignalR connection core.
//!
//! A [`Transport`] is the duplex carrier the connection speaks over once
//! negotiation has resolved: WebSockets or HTTP long-polling. The transport
//! reports lifecycle and inbound data through a [`TransportDelegate`] that it
//! holds only weakly — transport callbacks must never keep a connection
//! alive past user intent.
//!
//! # Delegate contract
//!
//! - `transport_did_open` fires at most once, and only before any receive.
//! - `transport_did_close` fires exactly once and is terminal; it strictly
//!   follows every other callback.
//! - After `transport_did_close`, `send` fails with
//!   [`SignalRError::InvalidState`](crate::SignalRError::InvalidState).

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use url::Url;

use crate::connection::HttpConnectionOptions;
use crate::error::{Result, SignalRError};

/// The transport protocols a server can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Full-duplex WebSocket frames.
    WebSockets,
    /// Server-sent events. Decoded for wire compatibility but never
    /// selected by the default factory.
    ServerSentEvents,
    /// HTTP long-polling.
    LongPolling,
}

impl TransportKind {
    /// The canonical wire string, as used in negotiate payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }

    /// Parse the canonical wire string. Unknown strings are rejected.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "WebSockets" => Some(Self::WebSockets),
            "ServerSentEvents" => Some(Self::ServerSentEvents),
            "LongPolling" => Some(Self::LongPolling),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire encoding a transport carries messages in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    /// UTF-8 text frames.
    Text,
    /// Raw binary frames.
    Binary,
}

impl TransferFormat {
    /// The canonical wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Binary => "Binary",
        }
    }

    /// Parse the canonical wire string. Unknown strings are a hard error at
    /// the decode layer.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(Self::Text),
            "Binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertised transport: its kind plus the formats it supports.
///
/// Immutable once decoded; equality is by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescription {
    /// The transport protocol.
    pub transport: TransportKind,
    /// The transfer formats the server supports on it.
    pub transfer_formats: Vec<TransferFormat>,
}

impl TransportDescription {
    /// Construct a description from its parts.
    #[must_use]
    pub fn new(transport: TransportKind, transfer_formats: Vec<TransferFormat>) -> Self {
        Self {
            transport,
            transfer_formats,
        }
    }
}

/// Receives transport lifecycle and data callbacks.
///
/// Implemented by the connection's transport-delegate adapter; transports
/// hold it as a [`Weak`] reference and silently drop callbacks once the
/// owner is gone.
pub trait TransportDelegate: Send + Sync {
    /// The transport is open and ready to carry traffic.
    fn transport_did_open(&self);

    /// The transport received a message.
    fn transport_did_receive_data(&self, data: Vec<u8>);

    /// The transport shut down. `error` is `None` on a clean close.
    fn transport_did_close(&self, error: Option<SignalRError>);
}

/// A duplex message carrier between client and server.
///
/// Implementations signal readiness via
/// [`TransportDelegate::transport_did_open`] rather than through the return
/// of [`start`](Transport::start) — a transport may legitimately open only
/// after its first successful poll.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the transport's own protocol already proves liveness.
    ///
    /// Long-polling does (every poll is a round-trip); a raw WebSocket does
    /// not, so the layer above must ping.
    fn inherent_keep_alive(&self) -> bool;

    /// Install the delegate receiving this transport's callbacks.
    fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>);

    /// Begin operation against `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport cannot begin operating at all
    /// (e.g. the WebSocket handshake fails). Failures after a successful
    /// start are reported via [`TransportDelegate::transport_did_close`].
    async fn start(self: Arc<Self>, url: Url, options: HttpConnectionOptions) -> Result<()>;

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`SignalRError::InvalidState`] once the transport has closed;
    /// otherwise the underlying send error.
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Initiate shutdown. Idempotent; eventually produces exactly one
    /// [`TransportDelegate::transport_did_close`].
    async fn close(&self);
}
