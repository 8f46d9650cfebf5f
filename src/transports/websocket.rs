//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! A thin adapter: the WebSocket wire protocol itself (framing, masking,
//! ping/pong, TLS via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream))
//! is handled entirely by `tokio-tungstenite`. This module only rewrites the
//! connection URL to the `ws`/`wss` scheme, applies the bearer and custom
//! headers to the handshake request, and translates frames into
//! [`TransportDelegate`] callbacks.
//!
//! The transport has no liveness detection of its own
//! (`inherent_keep_alive` is false); the layer above must ping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};
use url::Url;

use crate::connection::{build_request_headers, HttpConnectionOptions};
use crate::error::{Result, SignalRError};
use crate::mutex_lock;
use crate::transport::{Transport, TransportDelegate};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
pub struct WebSocketTransport {
    delegate: Mutex<Weak<dyn TransportDelegate>>,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    /// Set once `close` has been requested; gates `send`.
    closed: AtomicBool,
    /// Exactly-once guard for `transport_did_close`.
    close_emitted: AtomicBool,
}

impl WebSocketTransport {
    /// Create a WebSocket transport. It connects on [`Transport::start`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            delegate: Mutex::new(Weak::<NoopDelegate>::new()),
            sink: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let error = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.deliver_data(text.to_string().into_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    self.deliver_data(data.to_vec());
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "received WebSocket close frame");
                    break None;
                }
                // Ping/pong are handled by tungstenite; raw frames are never
                // produced by the read half.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = if self.closed.load(Ordering::SeqCst) {
                        None
                    } else {
                        match e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => None,
                            other => Some(SignalRError::Http(other.to_string())),
                        }
                    };
                    break error;
                }
                None => break None,
            }
        };
        self.emit_close(error);
    }

    fn deliver_data(&self, data: Vec<u8>) {
        if self.close_emitted.load(Ordering::SeqCst) {
            return;
        }
        if let Some(delegate) = mutex_lock(&self.delegate).upgrade() {
            delegate.transport_did_receive_data(data);
        }
    }

    fn emit_close(&self, error: Option<SignalRError>) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        debug!("websocket transport closed");
        if let Some(delegate) = mutex_lock(&self.delegate).upgrade() {
            delegate.transport_did_close(error);
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite an http(s) URL to the matching ws(s) scheme.
fn websocket_url(mut url: Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(SignalRError::InvalidOperation(format!(
                "unsupported URL scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SignalRError::InvalidOperation(format!("cannot rewrite scheme of {url}")))?;
    Ok(url)
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn inherent_keep_alive(&self) -> bool {
        false
    }

    fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>) {
        *mutex_lock(&self.delegate) = delegate;
    }

    async fn start(self: Arc<Self>, url: Url, options: HttpConnectionOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalRError::InvalidState);
        }
        let ws_url = websocket_url(url)?;
        debug!(url = %ws_url, "connecting websocket");

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalRError::Http(e.to_string()))?;
        for (name, value) in build_request_headers(&options) {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                SignalRError::InvalidOperation(format!("invalid header name {name:?}"))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|_| {
                SignalRError::InvalidOperation("invalid header value".to_owned())
            })?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SignalRError::Http(e.to_string()))?;
        debug!("websocket connection established");

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);

        // Open strictly precedes any receive: the read loop is spawned only
        // after the delegate has been told.
        if let Some(delegate) = mutex_lock(&self.delegate).upgrade() {
            delegate.transport_did_open();
        }
        tokio::spawn(Arc::clone(&self).read_loop(stream));
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalRError::InvalidState);
        }
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SignalRError::InvalidState)?;
        sink.send(Message::binary(data))
            .await
            .map_err(|e| SignalRError::Http(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                debug!("closing websocket");
                if let Err(e) = sink.send(Message::Close(None)).await {
                    warn!(error = %e, "failed to send close frame");
                }
                let _ = sink.close().await;
                // The read loop observes the close handshake (or the broken
                // stream) and reports transport_did_close.
            }
            // Never started; nothing will ever call back, so report here.
            None => self.emit_close(None),
        }
    }
}

/// Placeholder target so the delegate slot can start out dangling.
struct NoopDelegate;

impl TransportDelegate for NoopDelegate {
    fn transport_did_open(&self) {}
    fn transport_did_receive_data(&self, _data: Vec<u8>) {}
    fn transport_did_close(&self, _error: Option<SignalRError>) {}
}
