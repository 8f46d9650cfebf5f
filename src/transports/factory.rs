//! Transport selection.

use std::sync::Arc;

use crate::error::{Result, SignalRError};
use crate::http::HttpClient;
use crate::transport::{Transport, TransportDescription, TransportKind};
use crate::transports::LongPollingTransport;
#[cfg(feature = "transport-websocket")]
use crate::transports::WebSocketTransport;

/// Builds a [`Transport`] from the server's advertised list.
///
/// Implemented by [`DefaultTransportFactory`]; tests and custom stacks can
/// substitute their own.
pub trait TransportFactory: Send + Sync {
    /// Pick and construct a transport.
    ///
    /// # Errors
    ///
    /// Returns an error when none of the advertised transports is supported.
    fn make_transport(&self, available: &[TransportDescription]) -> Result<Arc<dyn Transport>>;
}

/// The default factory: WebSockets first, then long-polling.
///
/// ServerSentEvents is decoded for wire compatibility with servers that
/// advertise it, but this factory deliberately bypasses it.
pub struct DefaultTransportFactory {
    http: Arc<dyn HttpClient>,
}

impl DefaultTransportFactory {
    /// Create a factory whose long-polling transports use `http`.
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn make_transport(&self, available: &[TransportDescription]) -> Result<Arc<dyn Transport>> {
        #[cfg(feature = "transport-websocket")]
        if available
            .iter()
            .any(|d| d.transport == TransportKind::WebSockets)
        {
            return Ok(Arc::new(WebSocketTransport::new()));
        }
        if available
            .iter()
            .any(|d| d.transport == TransportKind::LongPolling)
        {
            return Ok(Arc::new(LongPollingTransport::new(Arc::clone(&self.http))));
        }
        Err(SignalRError::InvalidOperation(
            "no supported transport available".to_owned(),
        ))
    }
}
