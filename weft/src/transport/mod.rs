//! Resilient session transport: one WebSocket connection per command session.
//!
//! A single supervisor task owns the connection for the transport's lifetime:
//! it connects (behind the circuit breaker, with a bounded connect timeout),
//! pumps outgoing frames, emits application pings and arms a pong watchdog,
//! and classifies closes. Abnormal closes, send failures and pong timeouts
//! schedule a reconnect with exponential backoff and jitter; each attempt
//! regenerates the request id and, once a checkpoint is known, resumes from
//! it. Expected closes (marked before ENDNODE handling) and caller-initiated
//! disconnects never reconnect. When the retry budget is spent the transport
//! reports a fatal failure that the session runtime converts into a command
//! error, rolling the enclosing delivery back.

mod backoff;
mod breaker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::TransportSettings;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use task_frame::{RouteKey, TaskResponse};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::metrics::Metrics;

pub use backoff::{jittered, reconnect_delay};
pub use breaker::{BreakerConfig, BreakerOpen, CircuitBreaker};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing event/frame queue depth; senders back-pressure when full.
const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect: {0}")]
    Connect(String),
    #[error("reconnect attempts exhausted after {attempts} connects: {last}")]
    ReconnectsExhausted { attempts: u32, last: String },
    #[error("transport already opened")]
    AlreadyOpened,
    #[error("transport closed")]
    Closed,
}

/// What the session runtime observes from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection established. `reconnects` is 0 on the initial connect.
    Connected { reconnects: u32 },
    Frame(TaskResponse),
    /// The connection ended and will not reconnect.
    Closed { expected: bool },
    /// Fatal: retry budget spent or breaker open mid-stream.
    Failed(TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
    Finished,
}

enum Outbound {
    Frame(String),
    Close { code: u16, reason: String },
}

struct ResumeState {
    request_id: String,
    checkpoint_id: Option<String>,
}

struct Shared {
    settings: TransportSettings,
    breaker: &'static CircuitBreaker,
    metrics: Arc<Metrics>,
    session_id: String,
    resume: std::sync::Mutex<ResumeState>,
    expected_close: AtomicBool,
    intentional_close: AtomicBool,
    connected: AtomicBool,
    finished: AtomicBool,
}

impl Shared {
    fn lock_resume(&self) -> std::sync::MutexGuard<'_, ResumeState> {
        self.resume.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Builds the connect URL, regenerating the request id. The checkpoint is
    /// included only once a READY has assigned one.
    fn connect_url(&self) -> String {
        let mut resume = self.lock_resume();
        resume.request_id = Uuid::new_v4().to_string();
        let sep = if self.settings.agent_url.contains('?') {
            '&'
        } else {
            '?'
        };
        let mut url = format!(
            "{}{}session_id={}&request_id={}",
            self.settings.agent_url, sep, self.session_id, resume.request_id
        );
        if let Some(cp) = &resume.checkpoint_id {
            url.push_str("&checkpoint_id=");
            url.push_str(cp);
        }
        url
    }

    fn close_is_expected(&self) -> bool {
        self.expected_close.load(Ordering::SeqCst) || self.intentional_close.load(Ordering::SeqCst)
    }
}

/// One transport instance per session; owns at most one open connection.
pub struct SessionTransport {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: std::sync::Mutex<Option<mpsc::Receiver<Outbound>>>,
}

impl SessionTransport {
    pub fn new(
        session_id: impl Into<String>,
        settings: TransportSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_breaker(session_id, settings, metrics, CircuitBreaker::global())
    }

    pub fn with_breaker(
        session_id: impl Into<String>,
        settings: TransportSettings,
        metrics: Arc<Metrics>,
        breaker: &'static CircuitBreaker,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                settings,
                breaker,
                metrics,
                session_id: session_id.into(),
                resume: std::sync::Mutex::new(ResumeState {
                    request_id: Uuid::new_v4().to_string(),
                    checkpoint_id: None,
                }),
                expected_close: AtomicBool::new(false),
                intentional_close: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
            out_tx,
            out_rx: std::sync::Mutex::new(Some(out_rx)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Request id of the current (or next) connect attempt.
    pub fn request_id(&self) -> String {
        self.shared.lock_resume().request_id.clone()
    }

    pub fn checkpoint(&self) -> Option<String> {
        self.shared.lock_resume().checkpoint_id.clone()
    }

    /// Records the server-assigned checkpoint for resume URLs.
    pub fn set_checkpoint(&self, checkpoint_id: impl Into<String>) {
        self.shared.lock_resume().checkpoint_id = Some(checkpoint_id.into());
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TransportStatus {
        if self.shared.finished.load(Ordering::SeqCst) {
            TransportStatus::Finished
        } else if self.shared.connected.load(Ordering::SeqCst) {
            TransportStatus::Connected
        } else {
            TransportStatus::Disconnected
        }
    }

    /// Accept the next close without reconnecting, whatever its code.
    pub fn mark_expected_close(&self) {
        self.shared.expected_close.store(true, Ordering::SeqCst);
    }

    /// Caller-initiated disconnect; suppresses reconnection.
    pub async fn disconnect(&self, code: u16, reason: &str) {
        self.shared.intentional_close.store(true, Ordering::SeqCst);
        let _ = self
            .out_tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Queues one route-keyed frame. Frames queued while reconnecting are
    /// flushed once the connection is back.
    pub async fn send(&self, route: RouteKey, payload: &Value) -> Result<(), TransportError> {
        self.out_tx
            .send(Outbound::Frame(route.encode(payload)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Opens the connection and starts the supervisor. Resolves once the
    /// initial connect succeeds, or fails after the retry budget (or an open
    /// breaker). Later reconnects are autonomous and surface as events.
    pub async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let out_rx = self
            .out_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(TransportError::AlreadyOpened)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (initial_tx, initial_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(supervise(shared, out_rx, events_tx, initial_tx));

        match initial_rx.await {
            Ok(Ok(())) => Ok(events_rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }
}

/// Outcome of one established connection.
enum DriveEnd {
    /// Closed without need for reconnection.
    Clean { expected: bool },
    Abnormal(String),
}

async fn supervise(
    shared: Arc<Shared>,
    mut out_rx: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
    initial: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut initial = Some(initial);
    let mut reconnects: u32 = 0;
    let mut failed_connects: u32 = 0;

    let fatal = |shared: &Shared,
                 initial: &mut Option<oneshot::Sender<Result<(), TransportError>>>,
                 error: TransportError| {
        shared.finished.store(true, Ordering::SeqCst);
        match initial.take() {
            Some(tx) => {
                let _ = tx.send(Err(error));
                None
            }
            None => Some(error),
        }
    };

    loop {
        if let Err(open) = shared.breaker.try_acquire() {
            tracing::warn!(session_id = %shared.session_id, "connect refused by circuit breaker");
            if let Some(err) = fatal(&shared, &mut initial, open.into()) {
                let _ = events.send(TransportEvent::Failed(err)).await;
            }
            return;
        }

        match connect_once(&shared).await {
            Ok(ws) => {
                shared.breaker.record_success();
                failed_connects = 0;
                shared.connected.store(true, Ordering::SeqCst);
                if let Some(tx) = initial.take() {
                    let _ = tx.send(Ok(()));
                }
                tracing::info!(
                    session_id = %shared.session_id,
                    reconnects,
                    "session transport connected"
                );
                let _ = events.send(TransportEvent::Connected { reconnects }).await;

                let end = drive(&shared, ws, &mut out_rx, &events).await;
                shared.connected.store(false, Ordering::SeqCst);

                match end {
                    DriveEnd::Clean { expected } => {
                        shared.metrics.normal_closes.fetch_add(1, Ordering::Relaxed);
                        shared.finished.store(true, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed { expected }).await;
                        return;
                    }
                    DriveEnd::Abnormal(reason) if shared.close_is_expected() => {
                        // e.g. the peer drops with 1006 right after ENDNODE.
                        tracing::debug!(
                            session_id = %shared.session_id,
                            reason,
                            "abnormal close after expected-close mark, recording normal completion"
                        );
                        shared.metrics.normal_closes.fetch_add(1, Ordering::Relaxed);
                        shared.finished.store(true, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed { expected: true }).await;
                        return;
                    }
                    DriveEnd::Abnormal(reason) => {
                        shared
                            .metrics
                            .abnormal_closes
                            .fetch_add(1, Ordering::Relaxed);
                        shared.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                        reconnects += 1;
                        tracing::warn!(
                            session_id = %shared.session_id,
                            reason,
                            "abnormal close, scheduling reconnect"
                        );
                    }
                }
            }
            Err(e) => {
                shared.breaker.record_failure();
                failed_connects += 1;
                tracing::warn!(
                    session_id = %shared.session_id,
                    attempt = failed_connects,
                    error = %e,
                    "connect failed"
                );
                if failed_connects > shared.settings.max_reconnect_attempts {
                    let err = TransportError::ReconnectsExhausted {
                        attempts: failed_connects,
                        last: e.to_string(),
                    };
                    if let Some(err) = fatal(&shared, &mut initial, err) {
                        let _ = events.send(TransportEvent::Failed(err)).await;
                    }
                    return;
                }
            }
        }

        let attempt = failed_connects.max(1);
        let delay = jittered(reconnect_delay(
            attempt,
            Duration::from_millis(shared.settings.initial_reconnect_delay_ms),
            Duration::from_millis(shared.settings.max_reconnect_delay_ms),
        ));
        tokio::time::sleep(delay).await;
    }
}

async fn connect_once(shared: &Shared) -> Result<WsStream, TransportError> {
    let url = shared.connect_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    if let Some(token) = &shared.settings.agent_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let timeout = shared.settings.connection_timeout();
    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
        Err(_) => Err(TransportError::ConnectTimeout(timeout)),
    }
}

/// Pumps one established connection until it ends.
async fn drive(
    shared: &Shared,
    mut ws: WsStream,
    out_rx: &mut mpsc::Receiver<Outbound>,
    events: &mpsc::Sender<TransportEvent>,
) -> DriveEnd {
    let ping_period = shared.settings.ping_interval();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Far-future sleep, re-armed after each ping.
    let mut pong_watchdog = Box::pin(tokio::time::sleep(Duration::from_secs(86_400)));
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        return DriveEnd::Abnormal(format!("send failed: {e}"));
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws.send(Message::Close(Some(frame))).await;
                    return DriveEnd::Clean { expected: true };
                }
                // Transport handle dropped: nothing left to deliver for.
                None => return DriveEnd::Clean { expected: true },
            },

            _ = ping.tick() => {
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    return DriveEnd::Abnormal(format!("ping send failed: {e}"));
                }
                if !awaiting_pong {
                    awaiting_pong = true;
                    pong_watchdog
                        .as_mut()
                        .reset(tokio::time::Instant::now() + shared.settings.pong_timeout());
                }
            },

            _ = &mut pong_watchdog, if awaiting_pong => {
                return DriveEnd::Abnormal(format!(
                    "pong timeout after {:?}",
                    shared.settings.pong_timeout()
                ));
            },

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch_frame(shared, events, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    dispatch_frame(shared, events, &bytes).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                }
                Some(Ok(Message::Close(frame))) => {
                    let code: u16 = frame
                        .as_ref()
                        .map(|f| f.code.into())
                        .unwrap_or(1005);
                    let expected = shared.close_is_expected();
                    if expected || code == 1000 || code == 1001 {
                        return DriveEnd::Clean { expected };
                    }
                    return DriveEnd::Abnormal(format!("close code {code}"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return DriveEnd::Abnormal(format!("read failed: {e}")),
                None => return DriveEnd::Abnormal("connection ended".to_string()),
            },
        }
    }
}

async fn dispatch_frame(shared: &Shared, events: &mpsc::Sender<TransportEvent>, raw: &[u8]) {
    match serde_json::from_slice::<TaskResponse>(raw) {
        Ok(frame) => {
            // Bounded channel: a slow session runtime back-pressures the read
            // loop instead of buffering without limit.
            if events.send(TransportEvent::Frame(frame)).await.is_err() {
                tracing::debug!(session_id = %shared.session_id, "frame dropped, session gone");
            }
        }
        Err(e) => {
            tracing::warn!(
                session_id = %shared.session_id,
                error = %e,
                "discarding undecodable frame"
            );
        }
    }
}
