//! HTTP long-polling transport.
//!
//! The transport runs a background GET loop against the connection URL. The
//! first successful 200 is a handshake (its body is discarded) and opens the
//! transport; later 200s deliver their body as messages; an empty 200 is a
//! server-side poll timeout and just reissues. Sends go out as POSTs to the
//! same URL, and shutdown releases the server-side session with a DELETE.
//!
//! Every poll round-trips, so the transport reports
//! [`inherent_keep_alive`](Transport::inherent_keep_alive) — the layer above
//! does not need to ping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::connection::{build_request_headers, HttpConnectionOptions};
use crate::error::{Result, SignalRError};
use crate::http::{HttpClient, HttpResponse};
use crate::mutex_lock;
use crate::transport::{Transport, TransportDelegate};

/// A [`Transport`] that carries messages over HTTP long-polling.
pub struct LongPollingTransport {
    http: Arc<dyn HttpClient>,
    delegate: Mutex<Weak<dyn TransportDelegate>>,
    url: Mutex<Option<Url>>,
    options: Mutex<HttpConnectionOptions>,
    /// True while the poll loop should keep reissuing GETs.
    active: AtomicBool,
    /// True once the handshake 200 has been consumed.
    opened: AtomicBool,
    /// One-shot guard for the close path. Written only under `close_queue`.
    close_called: AtomicBool,
    /// Serializes `close` so the DELETE and the terminal callback run once.
    close_queue: tokio::sync::Mutex<()>,
    /// Serializes delegate callbacks: `transport_did_close` must strictly
    /// follow every open/data delivery, even when a poll completion races
    /// a concurrent `close`.
    callback_lock: Mutex<()>,
    close_error: Mutex<Option<SignalRError>>,
}

impl LongPollingTransport {
    /// Create a long-polling transport over the given HTTP client.
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            delegate: Mutex::new(Weak::<NoopDelegate>::new()),
            url: Mutex::new(None),
            options: Mutex::new(HttpConnectionOptions::default()),
            active: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            close_called: AtomicBool::new(false),
            close_queue: tokio::sync::Mutex::new(()),
            callback_lock: Mutex::new(()),
            close_error: Mutex::new(None),
        }
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        let options = mutex_lock(&self.options).clone();
        build_request_headers(&options)
    }

    /// The poll URL for one GET: the transport URL plus a `_` cache-buster.
    fn poll_url(&self) -> Option<Url> {
        let mut url = mutex_lock(&self.url).clone()?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        url.query_pairs_mut().append_pair("_", &millis.to_string());
        Some(url)
    }

    async fn poll_loop(self: Arc<Self>) {
        debug!("long polling loop started");
        while self.active.load(Ordering::SeqCst) {
            if mutex_lock(&self.delegate).upgrade().is_none() {
                debug!("transport delegate dropped, stopping poll loop");
                self.active.store(false, Ordering::SeqCst);
                break;
            }
            let Some(url) = self.poll_url() else {
                self.active.store(false, Ordering::SeqCst);
                break;
            };
            let headers = self.request_headers();
            match self.http.get(url, &headers).await {
                // A client-side timeout on a poll is not an error; the
                // server simply had nothing to say within the window.
                Err(SignalRError::Timeout) => {
                    debug!("poll timed out on the client side, reissuing");
                }
                Err(error) => {
                    warn!(error = %error, "poll request failed");
                    *mutex_lock(&self.close_error) = Some(error);
                    self.active.store(false, Ordering::SeqCst);
                }
                Ok(response) => self.handle_poll_response(response),
            }
        }
        self.close().await;
        debug!("long polling loop exited");
    }

    /// Process one poll completion. `active` is consulted only here, after
    /// the HTTP completion, so a `close` that raced the in-flight GET is
    /// observed rather than lost.
    fn handle_poll_response(&self, response: HttpResponse) {
        match response.status {
            200 => {
                if !self.opened.swap(true, Ordering::SeqCst) {
                    // The first 200 is a handshake, not data.
                    debug!("long polling transport opened");
                    self.deliver(TransportCallback::Open);
                } else if !response.body.is_empty() {
                    self.deliver(TransportCallback::Data(response.body));
                }
                // An empty 200 after open is a server-side poll timeout;
                // fall through and reissue.
            }
            204 => {
                debug!("server ended the long polling session");
                *mutex_lock(&self.close_error) = None;
                self.active.store(false, Ordering::SeqCst);
            }
            404 if !self.active.load(Ordering::SeqCst) => {
                // A poll was in flight when close() tore the session down;
                // the server has already destroyed it.
                debug!("poll returned 404 after close, ignoring");
            }
            status => {
                warn!(status, "poll returned an unexpected status");
                *mutex_lock(&self.close_error) = Some(SignalRError::WebError(status));
                self.active.store(false, Ordering::SeqCst);
            }
        }
    }

    fn deliver(&self, callback: TransportCallback) {
        let _serialized = mutex_lock(&self.callback_lock);
        if self.close_called.load(Ordering::SeqCst) {
            // transport_did_close has been (or is being) reported; nothing
            // may be delivered after it.
            return;
        }
        let Some(delegate) = mutex_lock(&self.delegate).upgrade() else {
            return;
        };
        match callback {
            TransportCallback::Open => delegate.transport_did_open(),
            TransportCallback::Data(data) => delegate.transport_did_receive_data(data),
        }
    }
}

enum TransportCallback {
    Open,
    Data(Vec<u8>),
}

#[async_trait]
impl Transport for LongPollingTransport {
    fn inherent_keep_alive(&self) -> bool {
        true
    }

    fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>) {
        *mutex_lock(&self.delegate) = delegate;
    }

    async fn start(self: Arc<Self>, url: Url, options: HttpConnectionOptions) -> Result<()> {
        debug!(url = %url, "starting long polling transport");
        *mutex_lock(&self.url) = Some(url);
        *mutex_lock(&self.options) = options;
        self.active.store(true, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        self.close_called.store(false, Ordering::SeqCst);
        *mutex_lock(&self.close_error) = None;
        tokio::spawn(Arc::clone(&self).poll_loop());
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(SignalRError::InvalidState);
        }
        let url = mutex_lock(&self.url)
            .clone()
            .ok_or(SignalRError::InvalidState)?;
        let headers = self.request_headers();
        // Network errors propagate verbatim.
        let response = self.http.post(url, &headers, data).await?;
        match response.status {
            200 => Ok(()),
            status => Err(SignalRError::WebError(status)),
        }
    }

    async fn close(&self) {
        let _queued = self.close_queue.lock().await;
        if self.close_called.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);

        let url_opt = mutex_lock(&self.url).clone();
        let delete_error = match url_opt {
            Some(url) => {
                debug!("releasing long polling session");
                let headers = self.request_headers();
                self.http.delete(url, &headers).await.err()
            }
            None => None,
        };
        if let Some(error) = &delete_error {
            warn!(error = %error, "session DELETE failed");
        }

        // The original cause wins; the DELETE error is surfaced only when
        // there is none.
        let error = mutex_lock(&self.close_error).take().or(delete_error);

        let _serialized = mutex_lock(&self.callback_lock);
        if let Some(delegate) = mutex_lock(&self.delegate).upgrade() {
            delegate.transport_did_close(error);
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
