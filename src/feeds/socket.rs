//! # WebSocket Feed Manager
//!
//! Persistent bidirectional channel with automatic recovery. A single driver
//! task owns the connection lifecycle: connect, read loop, heartbeat
//! sub-protocol, and reconnection with a capped exponential backoff budget.
//! Commands (send, disconnect) reach the driver over an mpsc channel so every
//! wait point stays inside one `tokio::select!`.
//!
//! Failed connect attempts and transport errors are folded into the same
//! close-and-retry path as server closes, synthesized as abnormal closures
//! (code 1006). A voluntary disconnect never reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::backoff::RetrySchedule;
use crate::core::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::core::history::MessageRecord;
use crate::core::target::Target;
use crate::error::{FeedError, SendOutcome};

use super::{
    maybe_deadline, maybe_tick, read_state, record_error, set_state, CloseEvent, CloseHook,
    DriverSlot, ErrorHook, ExhaustedHook, FeedShared, FeedState, FilterFn, MessageHook, OpenHook,
    ReconnectGate, SharedFeed,
};

/// Configuration for a socket feed.
#[derive(Clone)]
pub struct SocketOptions {
    /// Reconnect after unexpected closes.
    pub reconnect: bool,
    /// Retry budget per acquisition effort.
    pub max_reconnect_attempts: u32,
    /// Base delay of the exponential backoff (doubles per attempt).
    pub reconnect_interval: Duration,
    /// Subprotocols advertised in the `Sec-WebSocket-Protocol` header.
    pub protocols: Vec<String>,
    /// Application-level ping/pong settings.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Cap on the message history; unbounded when `None`.
    pub history_retention: Option<usize>,
    /// Raw-payload gate. Rejected messages are dropped before recording.
    pub filter: Option<FilterFn>,
    /// Per-close reconnect gate. Consulted with the close event before a
    /// retry is scheduled; `None` accepts every close.
    pub should_reconnect: Option<ReconnectGate>,
    pub on_open: Option<OpenHook>,
    pub on_close: Option<CloseHook>,
    pub on_message: Option<MessageHook>,
    pub on_error: Option<ErrorHook>,
    pub on_retries_exhausted: Option<ExhaustedHook>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(1),
            protocols: Vec::new(),
            heartbeat: None,
            history_retention: None,
            filter: None,
            should_reconnect: None,
            on_open: None,
            on_close: None,
            on_message: None,
            on_error: None,
            on_retries_exhausted: None,
        }
    }
}

/// Commands delivered to the running driver.
#[derive(Debug)]
enum SocketCommand {
    Send { payload: String },
    Disconnect { code: u16, reason: String },
}

/// Normalized incoming frame. Control frames are handled below this seam.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// The peer completed a close handshake.
    Closed(CloseEvent),
}

/// Connection factory seam. The default implementation dials with
/// tokio-tungstenite; tests substitute scripted connectors.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
    ) -> Result<Box<dyn SocketLink>, FeedError>;
}

/// One live WebSocket session.
#[async_trait]
pub trait SocketLink: Send {
    /// Next data frame. `None` means the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, FeedError>>;
    async fn send_text(&mut self, payload: String) -> Result<(), FeedError>;
    async fn close(&mut self, code: u16, reason: String) -> Result<(), FeedError>;
}

/// Default connector dialing over tokio-tungstenite.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
    ) -> Result<Box<dyn SocketLink>, FeedError> {
        let mut request = url.as_str().into_client_request()?;
        if !protocols.is_empty() {
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(&protocols.join(", "))?,
            );
        }
        let (stream, _response) = connect_async(request).await?;
        Ok(Box::new(TungsteniteLink { inner: stream }))
    }
}

struct TungsteniteLink {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketLink for TungsteniteLink {
    async fn next_frame(&mut self) -> Option<Result<Frame, FeedError>> {
        loop {
            return match self.inner.next().await {
                None => None,
                Some(Err(error)) => Some(Err(error.into())),
                Some(Ok(Message::Text(text))) => Some(Ok(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(bytes))) => Some(Ok(Frame::Binary(bytes.to_vec()))),
                Some(Ok(Message::Close(frame))) => Some(Ok(Frame::Closed(match frame {
                    Some(frame) => CloseEvent::new(frame.code.into(), frame.reason.to_string()),
                    None => CloseEvent::abnormal("connection lost"),
                }))),
                // Ping/Pong control frames are answered by the protocol layer.
                Some(Ok(_)) => continue,
            };
        }
    }

    async fn send_text(&mut self, payload: String) -> Result<(), FeedError> {
        // .into() converts String to Utf8Bytes for newer tungstenite versions
        self.inner
            .send(Message::Text(payload.into()))
            .await
            .map_err(FeedError::from)
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), FeedError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        self.inner.close(Some(frame)).await.map_err(FeedError::from)
    }
}

/// Resilient WebSocket channel manager.
///
/// Owns at most one driver task. `connect()` spawns it; `disconnect()` stops
/// the current session without scheduling a reconnect; `shutdown()` (also run
/// on drop) tears everything down unconditionally.
pub struct SocketFeed {
    target: Target,
    options: SocketOptions,
    connector: Arc<dyn SocketConnector>,
    shared: SharedFeed,
    slot: Arc<DriverSlot<SocketCommand>>,
    shutdown: CancellationToken,
}

impl SocketFeed {
    pub fn new(target: impl Into<Target>, options: SocketOptions) -> Self {
        Self::with_connector(target, options, Arc::new(TungsteniteConnector))
    }

    /// Builds the feed around a custom connection factory.
    pub fn with_connector(
        target: impl Into<Target>,
        options: SocketOptions,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let retention = options.history_retention;
        Self {
            target: target.into(),
            options,
            connector,
            shared: Arc::new(Mutex::new(FeedShared::new(retention))),
            slot: Arc::new(DriverSlot::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Opens the channel. No-op while a driver is connecting, open, or
    /// waiting out a backoff delay, and after `shutdown()`. A manual connect
    /// starts a fresh acquisition effort: the retry counter is reset.
    pub fn connect(&self) {
        if self.shutdown.is_cancelled() {
            log::warn!("Socket feed is shut down; connect ignored");
            return;
        }
        let Some(cmd_rx) = self.slot.activate() else {
            log::debug!("Socket driver already running; connect ignored");
            return;
        };
        {
            let mut guard = self.shared.lock().expect("feed state lock poisoned");
            guard.retry_count = 0;
            guard.last_error = None;
        }
        tokio::spawn(run_driver(
            self.target.clone(),
            self.options.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.shared),
            Arc::clone(&self.slot),
            self.shutdown.child_token(),
            cmd_rx,
        ));
    }

    /// Closes with code 1000 and reason "Client disconnect".
    pub fn disconnect(&self) {
        self.disconnect_with(1000, "Client disconnect");
    }

    /// Voluntary close: ends the session (or cancels a pending reconnect)
    /// and never schedules another attempt. Idempotent.
    pub fn disconnect_with(&self, code: u16, reason: &str) {
        let delivered = self.slot.command(SocketCommand::Disconnect {
            code,
            reason: reason.to_string(),
        });
        if !delivered {
            log::debug!("No socket driver running; disconnect ignored");
        }
    }

    /// Hands a text payload to the transport. At most once, never queued:
    /// when the channel is not open the payload is dropped with a warning.
    pub fn send(&self, payload: impl Into<String>) -> SendOutcome {
        if self.state() != FeedState::Open {
            log::warn!("Socket not open; dropping outbound message");
            return SendOutcome::NotReady;
        }
        let payload = payload.into();
        if self.slot.command(SocketCommand::Send { payload }) {
            SendOutcome::Sent
        } else {
            SendOutcome::NotReady
        }
    }

    /// Serializes the value and sends it as a text payload. A value that
    /// cannot be serialized is recorded as the last error and dropped.
    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> SendOutcome {
        match serde_json::to_string(value) {
            Ok(payload) => self.send(payload),
            Err(error) => {
                log::error!("Failed to serialize outbound message: {error}");
                let error = record_error(&self.shared, FeedError::Serialize(error));
                if let Some(hook) = &self.options.on_error {
                    hook(&error);
                }
                SendOutcome::NotReady
            }
        }
    }

    /// Tears the manager down: cancels reconnect and heartbeat timers and
    /// aborts in-flight work. Unconditional, idempotent, also run on drop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> FeedState {
        read_state(&self.shared)
    }

    /// Attempts started since the channel was last healthy.
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().expect("feed state lock poisoned").retry_count
    }

    pub fn last_error(&self) -> Option<Arc<FeedError>> {
        self.shared
            .lock()
            .expect("feed state lock poisoned")
            .last_error
            .clone()
    }

    pub fn last_message(&self) -> Option<MessageRecord> {
        self.shared
            .lock()
            .expect("feed state lock poisoned")
            .history
            .last()
            .cloned()
    }

    /// Latest payload that parsed as JSON. Messages that are not valid JSON
    /// leave the previous value in place.
    pub fn last_json(&self) -> Option<serde_json::Value> {
        self.shared
            .lock()
            .expect("feed state lock poisoned")
            .last_parsed
            .clone()
    }

    pub fn history(&self) -> Vec<MessageRecord> {
        self.shared
            .lock()
            .expect("feed state lock poisoned")
            .history
            .snapshot()
    }
}

impl Drop for SocketFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Why a session ended.
enum SessionEnd {
    /// Teardown token fired; exit silently.
    Shutdown,
    /// Client-initiated close; never reconnect.
    Voluntary { code: u16, reason: String },
    /// Server close, transport death, or heartbeat timeout.
    Dropped(CloseEvent),
}

/// Outcome of the connect phase.
enum Connected {
    Link(Box<dyn SocketLink>),
    Fail(FeedError),
    /// Shutdown or voluntary exit while connecting; state already settled.
    Abort,
}

async fn run_driver(
    target: Target,
    options: SocketOptions,
    connector: Arc<dyn SocketConnector>,
    shared: SharedFeed,
    slot: Arc<DriverSlot<SocketCommand>>,
    cancel: CancellationToken,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let schedule = RetrySchedule::exponential(
        options.reconnect_interval,
        2.0,
        options.max_reconnect_attempts,
    );

    'lifecycle: loop {
        set_state(&shared, FeedState::Connecting);
        log::info!("Connecting socket feed");

        let connected = {
            let connect = open_session(&target, &connector, &options.protocols);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        set_state(&shared, FeedState::Closed);
                        break Connected::Abort;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SocketCommand::Send { .. }) => {
                            log::warn!("Socket not open; dropping outbound message");
                        }
                        Some(SocketCommand::Disconnect { code, reason }) => {
                            set_state(&shared, FeedState::Closed);
                            let event = CloseEvent::new(code, reason);
                            if let Some(hook) = &options.on_close {
                                hook(&event);
                            }
                            break Connected::Abort;
                        }
                        None => {
                            set_state(&shared, FeedState::Closed);
                            break Connected::Abort;
                        }
                    },
                    result = &mut connect => break match result {
                        Ok(link) => Connected::Link(link),
                        Err(error) => Connected::Fail(error),
                    },
                }
            }
        };

        let end = match connected {
            Connected::Abort => break 'lifecycle,
            Connected::Fail(error) => {
                log::error!("Socket connect failed: {error}");
                let error = record_error(&shared, error);
                if let Some(hook) = &options.on_error {
                    hook(&error);
                }
                SessionEnd::Dropped(CloseEvent::abnormal("connect failed"))
            }
            Connected::Link(mut link) => {
                {
                    let mut guard = shared.lock().expect("feed state lock poisoned");
                    guard.state = FeedState::Open;
                    guard.retry_count = 0;
                }
                log::info!("Socket feed open");
                if let Some(hook) = &options.on_open {
                    hook();
                }
                run_session(&mut link, &options, &shared, &mut cmd_rx, &cancel).await
            }
        };

        match end {
            SessionEnd::Shutdown => {
                set_state(&shared, FeedState::Closed);
                break 'lifecycle;
            }
            SessionEnd::Voluntary { code, reason } => {
                set_state(&shared, FeedState::Closed);
                log::info!("Socket feed closed (code {code})");
                let event = CloseEvent::new(code, reason);
                if let Some(hook) = &options.on_close {
                    hook(&event);
                }
                break 'lifecycle;
            }
            SessionEnd::Dropped(event) => {
                set_state(&shared, FeedState::Closed);
                if let Some(hook) = &options.on_close {
                    hook(&event);
                }

                if !options.reconnect {
                    break 'lifecycle;
                }
                if let Some(gate) = &options.should_reconnect {
                    if !gate(&event) {
                        log::info!("Reconnect gate declined close code {}", event.code);
                        break 'lifecycle;
                    }
                }

                let attempt = shared.lock().expect("feed state lock poisoned").retry_count;
                match schedule.delay_for(attempt) {
                    Some(delay) => {
                        log::warn!(
                            "Socket feed lost (code {}). Retry {}/{} in {:?}",
                            event.code,
                            attempt + 1,
                            schedule.max_attempts(),
                            delay,
                        );
                        if !wait_backoff(delay, &mut cmd_rx, &cancel).await {
                            break 'lifecycle;
                        }
                        shared.lock().expect("feed state lock poisoned").retry_count += 1;
                    }
                    None => {
                        let attempts = schedule.max_attempts();
                        log::error!("Socket feed giving up after {attempts} reconnect attempts");
                        {
                            let mut guard = shared.lock().expect("feed state lock poisoned");
                            guard.state = FeedState::Failed;
                            guard.last_error =
                                Some(Arc::new(FeedError::RetriesExhausted(attempts)));
                        }
                        if let Some(hook) = &options.on_retries_exhausted {
                            hook(attempts);
                        }
                        break 'lifecycle;
                    }
                }
            }
        }
    }

    slot.release();
}

async fn open_session(
    target: &Target,
    connector: &Arc<dyn SocketConnector>,
    protocols: &[String],
) -> Result<Box<dyn SocketLink>, FeedError> {
    let url = target.resolve().await?;
    connector.connect(&url, protocols).await
}

async fn run_session(
    link: &mut Box<dyn SocketLink>,
    options: &SocketOptions,
    shared: &SharedFeed,
    cmd_rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let mut heartbeat = options.heartbeat.clone().map(Heartbeat::new);
    let mut ping_timer = heartbeat
        .as_ref()
        .map(|hb| tokio::time::interval(hb.interval()));

    loop {
        let pong_deadline = heartbeat.as_ref().and_then(Heartbeat::deadline);
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Shutdown,

            frame = link.next_frame() => match frame {
                Some(Ok(Frame::Text(raw))) => {
                    deliver_text(raw, heartbeat.as_mut(), options, shared);
                }
                Some(Ok(Frame::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(raw) => deliver_text(raw, heartbeat.as_mut(), options, shared),
                    Err(_) => log::debug!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Frame::Closed(event))) => return SessionEnd::Dropped(event),
                Some(Err(error)) => {
                    log::error!("Socket read error: {error}");
                    let error = record_error(shared, error);
                    if let Some(hook) = &options.on_error {
                        hook(&error);
                    }
                    return SessionEnd::Dropped(CloseEvent::abnormal("transport error"));
                }
                None => {
                    log::warn!("Socket stream closed by remote host");
                    return SessionEnd::Dropped(CloseEvent::abnormal("connection lost"));
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send { payload }) => {
                    if let Err(error) = link.send_text(payload).await {
                        log::error!("Socket write error: {error}");
                        let error = record_error(shared, error);
                        if let Some(hook) = &options.on_error {
                            hook(&error);
                        }
                        return SessionEnd::Dropped(CloseEvent::abnormal("transport error"));
                    }
                }
                Some(SocketCommand::Disconnect { code, reason }) => {
                    set_state(shared, FeedState::Closing);
                    if let Err(error) = link.close(code, reason.clone()).await {
                        log::debug!("Close handshake failed: {error}");
                    }
                    return SessionEnd::Voluntary { code, reason };
                }
                None => return SessionEnd::Shutdown,
            },

            _ = maybe_tick(ping_timer.as_mut()) => {
                if let Some(hb) = heartbeat.as_mut() {
                    let payload = hb.ping();
                    if let Err(error) = link.send_text(payload).await {
                        log::error!("Heartbeat write error: {error}");
                        let error = record_error(shared, error);
                        if let Some(hook) = &options.on_error {
                            hook(&error);
                        }
                        return SessionEnd::Dropped(CloseEvent::abnormal("transport error"));
                    }
                }
            }

            _ = maybe_deadline(pong_deadline) => {
                let timeout = heartbeat
                    .as_ref()
                    .map(Heartbeat::pong_timeout)
                    .unwrap_or_default();
                log::warn!("No heartbeat response within {timeout:?}; dropping connection");
                let error = record_error(shared, FeedError::HeartbeatTimeout(timeout));
                if let Some(hook) = &options.on_error {
                    hook(&error);
                }
                return SessionEnd::Dropped(CloseEvent::abnormal("heartbeat timeout"));
            }
        }
    }
}

/// Heartbeat settlement, then the filter gate, then record and notify.
fn deliver_text(
    raw: String,
    heartbeat: Option<&mut Heartbeat>,
    options: &SocketOptions,
    shared: &SharedFeed,
) {
    if let Some(hb) = heartbeat {
        if hb.settle(&raw) {
            return;
        }
    }
    if let Some(filter) = &options.filter {
        if !filter(&raw) {
            return;
        }
    }
    let record = MessageRecord::now("message", raw);
    shared
        .lock()
        .expect("feed state lock poisoned")
        .record_message(&record);
    if let Some(hook) = &options.on_message {
        hook(&record);
    }
}

/// Sleeps out a backoff delay while staying responsive to commands.
/// Returns false when the wait was cut short by shutdown or disconnect.
async fn wait_backoff(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    cancel: &CancellationToken,
) -> bool {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCommand::Send { .. }) => {
                    log::warn!("Socket not open; dropping outbound message");
                }
                Some(SocketCommand::Disconnect { .. }) | None => return false,
            },
            _ = &mut wait => return true,
        }
    }
}
