//! The HTTP connection: negotiation, transport lifecycle, and the
//! connection state machine.
//!
//! [`HttpConnection`] drives the negotiate handshake (following redirects),
//! asks the [`TransportFactory`] for a transport, and forwards transport
//! callbacks upward through an [`HttpConnectionDelegate`]. All user-visible
//! callbacks are funneled through one dispatcher task, so they arrive in
//! FIFO order on a single context and never run under an internal lock.
//!
//! # Lifecycle
//!
//! ```text
//! Initial ──start()──► Connecting ──transport open──► Connected
//!                          │                              │
//!                          └──── stop()/failure ──────────┴──► Stopped
//! ```
//!
//! `Stopped` is terminal for a connection instance. Exactly one of
//! "`connection_did_open` followed eventually by `connection_did_close`" or
//! "`connection_did_fail_to_open`" fires per connection lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Result, SignalRError};
use crate::http::{DefaultHttpClient, HttpClient};
use crate::mutex_lock;
use crate::negotiate::NegotiationResponse;
use crate::transport::{
    TransferFormat, Transport, TransportDelegate, TransportDescription, TransportKind,
};
use crate::transports::{DefaultTransportFactory, TransportFactory};

/// Redirect chains are not bounded by the protocol; cap them so a hostile
/// server cannot loop the client forever.
const MAX_NEGOTIATE_REDIRECTS: usize = 100;

/// Provides the bearer token attached to outgoing requests.
///
/// Called once per request; return `None` to send no `Authorization` header.
pub type AccessTokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// The lifecycle states of an [`HttpConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed; only `start` is valid.
    Initial,
    /// Negotiating and starting a transport.
    Connecting,
    /// Open for traffic.
    Connected,
    /// Terminal.
    Stopped,
}

/// Receives connection lifecycle and data callbacks.
///
/// Held weakly by the connection — the delegate owns the connection, never
/// the other way round. Callbacks arrive in FIFO order on the connection's
/// dispatcher task.
pub trait HttpConnectionDelegate: Send + Sync {
    /// The connection is open. `connection_id` is the server-assigned
    /// handle, absent when negotiation was skipped.
    fn connection_did_open(&self, connection_id: Option<String>);

    /// The connection could not be opened.
    fn connection_did_fail_to_open(&self, error: SignalRError);

    /// A message arrived. Never precedes `connection_did_open`.
    fn connection_did_receive_data(&self, data: Vec<u8>);

    /// The connection shut down; terminal. `error` is `None` on a clean
    /// stop; a user-supplied stop error wins over the transport's.
    fn connection_did_close(&self, error: Option<SignalRError>);
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for an [`HttpConnection`].
///
/// # Example
///
/// ```
/// use signalr_client::HttpConnectionOptions;
///
/// let options = HttpConnectionOptions::new()
///     .with_header("x-custom", "1")
///     .with_access_token_provider(|| Some("secret".to_owned()));
/// assert!(!options.skip_negotiation);
/// ```
#[derive(Clone)]
pub struct HttpConnectionOptions {
    /// Skip the negotiate handshake and connect a WebSocket directly.
    pub skip_negotiation: bool,
    /// Additional headers for every outgoing request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token source. Replaced internally when a negotiate
    /// redirect carries a token of its own.
    pub access_token_provider: Option<AccessTokenProvider>,
    /// Per-request timeout handed to the default HTTP client. Must exceed
    /// the server's long-poll window.
    pub request_timeout: Duration,
}

impl HttpConnectionOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip negotiation and go straight to a WebSocket.
    #[must_use]
    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    /// Add a header to every outgoing request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the bearer token source.
    #[must_use]
    pub fn with_access_token_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.access_token_provider = Some(Arc::new(provider));
        self
    }

    /// Set the per-request timeout for the default HTTP client.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        Self {
            skip_negotiation: false,
            headers: HashMap::new(),
            access_token_provider: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl fmt::Debug for HttpConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectionOptions")
            .field("skip_negotiation", &self.skip_negotiation)
            .field("headers", &self.headers)
            .field(
                "access_token_provider",
                &self.access_token_provider.as_ref().map(|_| "<provider>"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Materialize the request headers for one outgoing request: the configured
/// custom headers plus a bearer `Authorization` from the token provider.
pub(crate) fn build_request_headers(options: &HttpConnectionOptions) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = options
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if let Some(provider) = &options.access_token_provider {
        if let Some(token) = provider() {
            headers.push(("Authorization".to_owned(), format!("Bearer {token}")));
        }
    }
    headers
}

// ── Start barrier ───────────────────────────────────────────────────

/// One-shot latch serializing `stop` behind an in-flight `start`.
///
/// Entered at the beginning of `start`, left by whichever path resolves it
/// (transport open, fail-open, or transport close during connecting).
/// `stop` blocks on it so shutdown never races past negotiation.
struct StartBarrier {
    entered: watch::Sender<bool>,
}

impl StartBarrier {
    fn new() -> Self {
        let (entered, _) = watch::channel(false);
        Self { entered }
    }

    fn enter(&self) {
        self.entered.send_replace(true);
    }

    fn leave(&self) {
        self.entered.send_replace(false);
    }

    async fn wait(&self) {
        let mut rx = self.entered.subscribe();
        // The sender lives as long as `self`; a closed channel cannot be
        // observed here.
        let _ = rx.wait_for(|entered| !*entered).await;
    }
}

// ── Connection ──────────────────────────────────────────────────────

/// User-visible callbacks, queued to the dispatcher task.
enum ConnectionEvent {
    Opened(Option<String>),
    Data(Vec<u8>),
    FailedToOpen(SignalRError),
    Closed(Option<SignalRError>),
}

struct HttpConnectionCore {
    url: Mutex<Url>,
    options: Mutex<HttpConnectionOptions>,
    http: Arc<dyn HttpClient>,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connection_id: Mutex<Option<String>>,
    stop_error: Mutex<Option<SignalRError>>,
    start_barrier: StartBarrier,
    /// One-shot guard: at most one of `FailedToOpen`/`Closed` resolves the
    /// connection lifetime, whichever path gets there first.
    terminal_emitted: AtomicBool,
    delegate: Mutex<Weak<dyn HttpConnectionDelegate>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl HttpConnectionCore {
    /// Compare-and-set on the connection state. Returns the previous state
    /// iff `from` is `None` (force-set) or matches the current state.
    fn change_state(
        &self,
        from: Option<ConnectionState>,
        to: ConnectionState,
    ) -> Option<ConnectionState> {
        let mut state = mutex_lock(&self.state);
        if let Some(from) = from {
            if *state != from {
                return None;
            }
        }
        let previous = *state;
        *state = to;
        Some(previous)
    }

    fn state(&self) -> ConnectionState {
        *mutex_lock(&self.state)
    }

    fn current_url(&self) -> Url {
        mutex_lock(&self.url).clone()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Emit a lifetime-resolving event unless one was already emitted.
    fn emit_terminal(&self, event: ConnectionEvent) {
        if self.terminal_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(event);
    }

    /// Resolve a failed start: move to `Stopped`, report, release `stop`.
    fn fail_open(&self, error: SignalRError) {
        error!(error = %error, "connection failed to open");
        let _ = self.change_state(None, ConnectionState::Stopped);
        self.emit_terminal(ConnectionEvent::FailedToOpen(error));
        self.start_barrier.leave();
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let options = mutex_lock(&self.options).clone();
        build_request_headers(&options)
    }

    fn override_access_token(&self, token: String) {
        let provider: AccessTokenProvider = Arc::new(move || Some(token.clone()));
        mutex_lock(&self.options).access_token_provider = Some(provider);
    }
}

/// A logical SignalR connection over a negotiated transport.
///
/// Create one per logical session; a stopped connection cannot be
/// restarted. Must be constructed inside a Tokio runtime (the callback
/// dispatcher is spawned at construction).
pub struct HttpConnection {
    core: Arc<HttpConnectionCore>,
    /// The adapter transports call back into; owned here so the transport's
    /// weak reference stays alive exactly as long as the connection.
    adapter: Arc<TransportDelegateAdapter>,
}

impl HttpConnection {
    /// Create a connection using the reqwest-backed HTTP client and the
    /// default transport factory.
    #[must_use]
    pub fn new(url: Url, options: HttpConnectionOptions) -> Self {
        let http: Arc<dyn HttpClient> = Arc::new(DefaultHttpClient::new(options.request_timeout));
        let factory = Arc::new(DefaultTransportFactory::new(Arc::clone(&http)));
        Self::with_parts(url, options, http, factory)
    }

    /// Create a connection with a custom HTTP client (the default factory
    /// will build long-polling transports over it).
    #[must_use]
    pub fn with_http_client(
        url: Url,
        options: HttpConnectionOptions,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(Arc::clone(&http)));
        Self::with_parts(url, options, http, factory)
    }

    /// Create a connection with a custom HTTP client and transport factory.
    #[must_use]
    pub fn with_parts(
        url: Url,
        options: HttpConnectionOptions,
        http: Arc<dyn HttpClient>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let core = Arc::new(HttpConnectionCore {
            url: Mutex::new(url),
            options: Mutex::new(options),
            http,
            factory,
            state: Mutex::new(ConnectionState::Initial),
            transport: Mutex::new(None),
            connection_id: Mutex::new(None),
            stop_error: Mutex::new(None),
            start_barrier: StartBarrier::new(),
            terminal_emitted: AtomicBool::new(false),
            delegate: Mutex::new(Weak::<NoopConnectionDelegate>::new()),
            events: events_tx,
        });
        let adapter = Arc::new(TransportDelegateAdapter {
            connection: Arc::downgrade(&core),
        });

        // Dispatcher: drains the event queue and invokes the delegate, one
        // callback at a time, holding no locks. Exits when the core drops.
        let dispatch_core = Arc::downgrade(&core);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let delegate = match dispatch_core.upgrade() {
                    Some(core) => mutex_lock(&core.delegate).upgrade(),
                    None => break,
                };
                let Some(delegate) = delegate else { continue };
                match event {
                    ConnectionEvent::Opened(id) => delegate.connection_did_open(id),
                    ConnectionEvent::Data(data) => delegate.connection_did_receive_data(data),
                    ConnectionEvent::FailedToOpen(e) => delegate.connection_did_fail_to_open(e),
                    ConnectionEvent::Closed(e) => delegate.connection_did_close(e),
                }
            }
            debug!("connection event dispatcher exited");
        });

        Self { core, adapter }
    }

    /// Install the delegate receiving this connection's callbacks.
    pub fn set_delegate(&self, delegate: Weak<dyn HttpConnectionDelegate>) {
        *mutex_lock(&self.core.delegate) = delegate;
    }

    /// Open the connection: negotiate (unless skipped), pick a transport,
    /// and start it. The outcome arrives via the delegate — either
    /// `connection_did_open` or `connection_did_fail_to_open`.
    pub async fn start(&self) {
        let core = &self.core;
        if core
            .change_state(Some(ConnectionState::Initial), ConnectionState::Connecting)
            .is_none()
        {
            warn!("start called while not in the initial state");
            // Reported without touching the start barrier.
            core.emit(ConnectionEvent::FailedToOpen(SignalRError::InvalidState));
            return;
        }
        info!(url = %core.current_url(), "starting connection");
        core.start_barrier.enter();

        let skip_negotiation = mutex_lock(&core.options).skip_negotiation;
        if skip_negotiation {
            // No negotiate round-trip: WebSockets only, no connection id.
            let synthetic = [TransportDescription::new(
                TransportKind::WebSockets,
                vec![TransferFormat::Text, TransferFormat::Binary],
            )];
            match core.factory.make_transport(&synthetic) {
                Ok(transport) => self.start_transport(transport, None).await,
                Err(error) => core.fail_open(error),
            }
            return;
        }

        self.negotiate().await;
    }

    async fn negotiate(&self) {
        let core = &self.core;
        for _ in 0..=MAX_NEGOTIATE_REDIRECTS {
            let negotiate_url = match negotiate_url(&core.current_url()) {
                Ok(url) => url,
                Err(error) => return core.fail_open(error),
            };
            debug!(url = %negotiate_url, "negotiating");
            let headers = core.request_headers();
            let response = match core.http.post(negotiate_url, &headers, Vec::new()).await {
                Ok(response) => response,
                Err(error) => return core.fail_open(error),
            };
            if response.status != 200 {
                return core.fail_open(SignalRError::WebError(response.status));
            }
            let decoded = match NegotiationResponse::from_slice(&response.body) {
                Ok(decoded) => decoded,
                Err(error) => {
                    return core.fail_open(SignalRError::InvalidNegotiationResponse(
                        error.to_string(),
                    ))
                }
            };
            match decoded {
                NegotiationResponse::Error { message } => {
                    return core.fail_open(SignalRError::InvalidNegotiationResponse(message));
                }
                NegotiationResponse::Redirection { url, access_token } => {
                    info!(url = %url, "negotiate redirected");
                    *mutex_lock(&core.url) = url;
                    core.override_access_token(access_token);
                    // Re-negotiate at the new URL.
                }
                NegotiationResponse::PayloadV0 {
                    connection_id,
                    available_transports,
                } => {
                    let query_id = connection_id.clone();
                    return self
                        .finish_negotiate(connection_id, query_id, available_transports)
                        .await;
                }
                NegotiationResponse::PayloadV1 {
                    connection_id,
                    connection_token,
                    available_transports,
                } => {
                    return self
                        .finish_negotiate(connection_id, connection_token, available_transports)
                        .await;
                }
            }
        }
        core.fail_open(SignalRError::InvalidNegotiationResponse(
            "too many negotiate redirects".to_owned(),
        ));
    }

    async fn finish_negotiate(
        &self,
        connection_id: String,
        query_id: String,
        available_transports: Vec<TransportDescription>,
    ) {
        let core = &self.core;
        if available_transports.is_empty() {
            return core.fail_open(SignalRError::InvalidNegotiationResponse(
                "negotiate returned an empty list of transports".to_owned(),
            ));
        }
        let transport = match core.factory.make_transport(&available_transports) {
            Ok(transport) => transport,
            Err(error) => return core.fail_open(error),
        };
        *mutex_lock(&core.connection_id) = Some(connection_id);
        self.start_transport(transport, Some(query_id)).await;
    }

    async fn start_transport(&self, transport: Arc<dyn Transport>, query_id: Option<String>) {
        let core = &self.core;
        // A stop may have raced in while negotiate was in flight.
        if core.state() != ConnectionState::Connecting {
            return core.fail_open(SignalRError::ConnectionIsBeingClosed);
        }
        let mut url = core.current_url();
        if let Some(id) = &query_id {
            url.query_pairs_mut().append_pair("id", id);
        }
        transport.set_delegate(Arc::downgrade(&self.adapter) as Weak<dyn TransportDelegate>);
        *mutex_lock(&core.transport) = Some(Arc::clone(&transport));
        let options = mutex_lock(&core.options).clone();
        debug!(url = %url, "starting transport");
        if let Err(error) = transport.start(url, options).await {
            core.fail_open(error);
        }
    }

    /// Send one message over the open connection.
    ///
    /// # Errors
    ///
    /// Returns [`SignalRError::InvalidState`] unless the connection is
    /// connected; transport failures surface here and only here — they do
    /// not close the connection.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.core.state() != ConnectionState::Connected {
            return Err(SignalRError::InvalidState);
        }
        let transport = mutex_lock(&self.core.transport)
            .clone()
            .ok_or(SignalRError::InvalidState)?;
        transport.send(data).await
    }

    /// Stop the connection. `error` (if any) becomes the cause reported in
    /// the final `connection_did_close`, winning over any transport error.
    ///
    /// Waits for an in-flight `start` to resolve before tearing down, so a
    /// stop can never race past negotiation.
    pub async fn stop(&self, error: Option<SignalRError>) {
        let core = &self.core;
        let previous = core
            .change_state(None, ConnectionState::Stopped)
            .unwrap_or(ConnectionState::Stopped);
        match previous {
            ConnectionState::Stopped => {
                debug!("stop called on an already stopped connection");
                return;
            }
            ConnectionState::Initial => {
                warn!("stop called on a connection that was never started");
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        info!("stopping connection");
        core.start_barrier.wait().await;

        let transport = mutex_lock(&core.transport).clone();
        match transport {
            Some(transport) => {
                *mutex_lock(&core.stop_error) = error;
                transport.close().await;
            }
            // Start never got past negotiation; nothing will call back.
            None => core.emit_terminal(ConnectionEvent::Closed(error)),
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// The server-assigned connection handle, once negotiated.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        mutex_lock(&self.core.connection_id).clone()
    }

    /// The current base URL (updated when a negotiate redirect is followed).
    #[must_use]
    pub fn url(&self) -> Url {
        self.core.current_url()
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("url", &self.core.current_url().as_str())
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

/// Append the `negotiate` path segment and the protocol version, preserving
/// any pre-existing query.
fn negotiate_url(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| {
            SignalRError::InvalidOperation(format!("cannot-be-a-base URL: {base}"))
        })?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

// ── Transport delegate adapter ──────────────────────────────────────

/// Forwards transport callbacks into the connection.
///
/// Holds the connection core weakly: a transport callback arriving after
/// the owner dropped the connection simply evaporates.
struct TransportDelegateAdapter {
    connection: Weak<HttpConnectionCore>,
}

impl TransportDelegate for TransportDelegateAdapter {
    fn transport_did_open(&self) {
        let Some(core) = self.connection.upgrade() else {
            return;
        };
        if core
            .change_state(Some(ConnectionState::Connecting), ConnectionState::Connected)
            .is_some()
        {
            debug!("transport opened, connection is up");
            let connection_id = mutex_lock(&core.connection_id).clone();
            core.emit(ConnectionEvent::Opened(connection_id));
        } else {
            // Stop won the race; the pending stop will close the transport.
            debug!("transport opened after the connection moved on");
        }
        core.start_barrier.leave();
    }

    fn transport_did_receive_data(&self, data: Vec<u8>) {
        let Some(core) = self.connection.upgrade() else {
            return;
        };
        core.emit(ConnectionEvent::Data(data));
    }

    fn transport_did_close(&self, error: Option<SignalRError>) {
        let Some(core) = self.connection.upgrade() else {
            return;
        };
        let previous = core
            .change_state(None, ConnectionState::Stopped)
            .unwrap_or(ConnectionState::Stopped);
        // A user-requested stop error wins over the transport's cause.
        let cause = mutex_lock(&core.stop_error).take().or(error);
        if previous == ConnectionState::Connecting {
            debug!("transport closed while connecting");
            core.emit_terminal(ConnectionEvent::FailedToOpen(
                cause.unwrap_or(SignalRError::ConnectionIsBeingClosed),
            ));
            core.start_barrier.leave();
        } else {
            debug!("transport closed");
            core.emit_terminal(ConnectionEvent::Closed(cause));
        }
    }
}

/// Placeholder target so the delegate slot can start out dangling.
struct NoopConnectionDelegate;

impl HttpConnectionDelegate for NoopConnectionDelegate {
    fn connection_did_open(&self, _connection_id: Option<String>) {}
    fn connection_did_fail_to_open(&self, _error: SignalRError) {}
    fn connection_did_receive_data(&self, _data: Vec<u8>) {}
    fn connection_did_close(&self, _error: Option<SignalRError>) {}
}
