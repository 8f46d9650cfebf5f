#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Shared test utilities for the SignalR client integration tests.
//!
//! Provides a scripted [`StubHttpClient`], stub transports and factories,
//! and channel-backed recording delegates for both the transport and the
//! connection layer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use signalr_client::{
    HttpClient, HttpConnectionDelegate, HttpConnectionOptions, HttpResponse, SignalRError,
    Transport, TransportDelegate, TransportDescription, TransportFactory,
};

// ── Scripted HTTP client ────────────────────────────────────────────

/// One request observed by the stub client.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Look up a recorded header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One scripted answer, optionally gated on a oneshot so tests can hold a
/// request in flight.
pub struct Scripted {
    gate: Option<oneshot::Receiver<()>>,
    result: Result<HttpResponse, SignalRError>,
}

impl Scripted {
    pub fn ok(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            gate: None,
            result: Ok(HttpResponse::new(status, body.into())),
        }
    }

    pub fn err(error: SignalRError) -> Self {
        Self {
            gate: None,
            result: Err(error),
        }
    }

    /// Hold this response until the returned sender fires.
    pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.gate = Some(rx);
        (self, tx)
    }
}

/// A scripted HTTP client: responses are consumed in order per method, and
/// every request is recorded.
///
/// When a method's script runs dry, GETs hang forever (mimicking an idle
/// long poll) while POSTs and DELETEs answer `200` with an empty body.
pub struct StubHttpClient {
    gets: Mutex<VecDeque<Scripted>>,
    posts: Mutex<VecDeque<Scripted>>,
    deletes: Mutex<VecDeque<Scripted>>,
    pub get_requests: Mutex<Vec<RecordedRequest>>,
    pub post_requests: Mutex<Vec<RecordedRequest>>,
    pub delete_requests: Mutex<Vec<RecordedRequest>>,
}

impl StubHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gets: Mutex::new(VecDeque::new()),
            posts: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(VecDeque::new()),
            get_requests: Mutex::new(Vec::new()),
            post_requests: Mutex::new(Vec::new()),
            delete_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn script_get(&self, scripted: Scripted) {
        self.gets.lock().unwrap().push_back(scripted);
    }

    pub fn script_post(&self, scripted: Scripted) {
        self.posts.lock().unwrap().push_back(scripted);
    }

    pub fn script_delete(&self, scripted: Scripted) {
        self.deletes.lock().unwrap().push_back(scripted);
    }

    pub fn get_count(&self) -> usize {
        self.get_requests.lock().unwrap().len()
    }

    pub fn post_count(&self) -> usize {
        self.post_requests.lock().unwrap().len()
    }

    pub fn delete_count(&self) -> usize {
        self.delete_requests.lock().unwrap().len()
    }

    async fn answer(
        queue: &Mutex<VecDeque<Scripted>>,
        hang_when_dry: bool,
    ) -> Result<HttpResponse, SignalRError> {
        let next = queue.lock().unwrap().pop_front();
        match next {
            Some(Scripted { gate, result }) => {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                result
            }
            None if hang_when_dry => std::future::pending().await,
            None => Ok(HttpResponse::new(200, Vec::new())),
        }
    }
}

#[async_trait]
impl HttpClient for StubHttpClient {
    async fn get(
        &self,
        url: Url,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, SignalRError> {
        self.get_requests.lock().unwrap().push(RecordedRequest {
            url,
            headers: headers.to_vec(),
            body: Vec::new(),
        });
        Self::answer(&self.gets, true).await
    }

    async fn post(
        &self,
        url: Url,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, SignalRError> {
        self.post_requests.lock().unwrap().push(RecordedRequest {
            url,
            headers: headers.to_vec(),
            body,
        });
        Self::answer(&self.posts, false).await
    }

    async fn delete(
        &self,
        url: Url,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, SignalRError> {
        self.delete_requests.lock().unwrap().push(RecordedRequest {
            url,
            headers: headers.to_vec(),
            body: Vec::new(),
        });
        Self::answer(&self.deletes, false).await
    }
}

// ── Recording transport delegate ────────────────────────────────────

/// Events observed by a [`RecordingTransportDelegate`].
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Data(Vec<u8>),
    Close(Option<SignalRError>),
}

/// A [`TransportDelegate`] that forwards callbacks onto a channel.
pub struct RecordingTransportDelegate {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl RecordingTransportDelegate {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TransportDelegate for RecordingTransportDelegate {
    fn transport_did_open(&self) {
        let _ = self.tx.send(TransportEvent::Open);
    }

    fn transport_did_receive_data(&self, data: Vec<u8>) {
        let _ = self.tx.send(TransportEvent::Data(data));
    }

    fn transport_did_close(&self, error: Option<SignalRError>) {
        let _ = self.tx.send(TransportEvent::Close(error));
    }
}

// ── Recording connection delegate ───────────────────────────────────

/// Events observed by a [`RecordingConnectionDelegate`].
#[derive(Debug)]
pub enum ConnectionEventRecord {
    Opened(Option<String>),
    Data(Vec<u8>),
    FailedToOpen(SignalRError),
    Closed(Option<SignalRError>),
}

/// An [`HttpConnectionDelegate`] that forwards callbacks onto a channel.
pub struct RecordingConnectionDelegate {
    tx: mpsc::UnboundedSender<ConnectionEventRecord>,
}

impl RecordingConnectionDelegate {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl HttpConnectionDelegate for RecordingConnectionDelegate {
    fn connection_did_open(&self, connection_id: Option<String>) {
        let _ = self.tx.send(ConnectionEventRecord::Opened(connection_id));
    }

    fn connection_did_fail_to_open(&self, error: SignalRError) {
        let _ = self.tx.send(ConnectionEventRecord::FailedToOpen(error));
    }

    fn connection_did_receive_data(&self, data: Vec<u8>) {
        let _ = self.tx.send(ConnectionEventRecord::Data(data));
    }

    fn connection_did_close(&self, error: Option<SignalRError>) {
        let _ = self.tx.send(ConnectionEventRecord::Closed(error));
    }
}

// ── Stub transport and factory ──────────────────────────────────────

/// A scriptable [`Transport`] for connection-level tests.
///
/// Opens immediately on `start` when `open_on_start` is set; otherwise the
/// test drives it via [`open`](Self::open), [`feed`](Self::feed), and
/// [`fail`](Self::fail).
pub struct StubTransport {
    open_on_start: bool,
    delegate: Mutex<Option<Weak<dyn TransportDelegate>>>,
    pub started_with: Mutex<Option<Url>>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub close_calls: Mutex<usize>,
    close_emitted: AtomicBool,
}

impl StubTransport {
    pub fn new(open_on_start: bool) -> Arc<Self> {
        Arc::new(Self {
            open_on_start,
            delegate: Mutex::new(None),
            started_with: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            close_calls: Mutex::new(0),
            close_emitted: AtomicBool::new(false),
        })
    }

    fn upgraded(&self) -> Option<Arc<dyn TransportDelegate>> {
        self.delegate.lock().unwrap().as_ref()?.upgrade()
    }

    /// Report the transport as open.
    pub fn open(&self) {
        if let Some(delegate) = self.upgraded() {
            delegate.transport_did_open();
        }
    }

    /// Deliver bytes to the delegate.
    pub fn feed(&self, data: impl Into<Vec<u8>>) {
        if let Some(delegate) = self.upgraded() {
            delegate.transport_did_receive_data(data.into());
        }
    }

    /// Report a terminal transport failure.
    pub fn fail(&self, error: Option<SignalRError>) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(delegate) = self.upgraded() {
            delegate.transport_did_close(error);
        }
    }

    pub fn start_url(&self) -> Option<Url> {
        self.started_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn inherent_keep_alive(&self) -> bool {
        false
    }

    fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    async fn start(
        self: Arc<Self>,
        url: Url,
        _options: HttpConnectionOptions,
    ) -> Result<(), SignalRError> {
        *self.started_with.lock().unwrap() = Some(url);
        if self.open_on_start {
            self.open();
        }
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), SignalRError> {
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) {
        *self.close_calls.lock().unwrap() += 1;
        self.fail(None);
    }
}

/// A [`TransportFactory`] that hands out a fixed transport and records the
/// advertised lists it was asked to choose from.
pub struct StubTransportFactory {
    transport: Arc<StubTransport>,
    pub advertised: Mutex<Vec<Vec<TransportDescription>>>,
}

impl StubTransportFactory {
    pub fn new(transport: Arc<StubTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            advertised: Mutex::new(Vec::new()),
        })
    }
}

impl TransportFactory for StubTransportFactory {
    fn make_transport(
        &self,
        available: &[TransportDescription],
    ) -> Result<Arc<dyn Transport>, SignalRError> {
        self.advertised.lock().unwrap().push(available.to_vec());
        Ok(Arc::clone(&self.transport) as Arc<dyn Transport>)
    }
}

// ── JSON fixtures ───────────────────────────────────────────────────

/// The canonical v1 negotiate payload advertising WebSockets + LongPolling.
pub fn canonical_v1_payload() -> Vec<u8> {
    br#"{"connectionId":"6baUtSEmluCoKvmUIqLUJw","connectionToken":"05AnRuTSWxWFNpYSN6cDEg","negotiateVersion":1,"availableTransports":[{"transport":"WebSockets","transferFormats":["Text","Binary"]},{"transport":"LongPolling","transferFormats":["Text","Binary"]}]}"#
        .to_vec()
}

/// A v1 payload advertising only LongPolling.
pub fn long_polling_only_payload() -> Vec<u8> {
    br#"{"connectionId":"lp-conn-id","connectionToken":"lp-conn-token","negotiateVersion":1,"availableTransports":[{"transport":"LongPolling","transferFormats":["Text","Binary"]}]}"#
        .to_vec()
}

/// A v1 payload with an empty transport list.
pub fn empty_transports_payload() -> Vec<u8> {
    br#"{"connectionId":"123","connectionToken":"tok","negotiateVersion":1,"availableTransports":[]}"#
        .to_vec()
}

/// A negotiate redirect to `url` carrying `access_token`.
pub fn redirect_payload(url: &str, access_token: &str) -> Vec<u8> {
    format!(r#"{{"url":"{url}","accessToken":"{access_token}"}}"#).into_bytes()
}

/// Parse a URL in tests.
pub fn url(s: &str) -> Url {
    Url::parse(s).expect("test URL")
}

/// Await the next event from a recorder, failing the test after 5 seconds.
pub async fn next_event<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Assert that no further event arrives within a settle window.
pub async fn assert_no_event<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
        Err(_) => {}
        Ok(Some(event)) => panic!("unexpected event: {event:?}"),
        Ok(None) => {}
    }
}
