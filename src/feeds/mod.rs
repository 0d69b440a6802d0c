//! # Feed Transports
//!
//! One manager per transport strategy, all sharing the same observable
//! surface: a state machine snapshot, a retry counter, the last error, the
//! last parsed payload, and the message history. Each manager owns at most
//! one driver task; every wait point inside a driver is cancellable through
//! the manager's cancellation token.

pub mod event_stream;
pub mod poll;
pub mod socket;
pub mod sse_wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};

use crate::core::history::{MessageHistory, MessageRecord};
use crate::error::FeedError;

/// Lifecycle of a feed channel.
///
/// `Failed` means the retry budget is exhausted; only a manual
/// `connect()`/`start()` leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No connection attempt has been made yet.
    Idle,
    /// A session is being established.
    Connecting,
    /// The channel is live.
    Open,
    /// A voluntary close is in flight.
    Closing,
    /// The channel is down. A reconnect may be pending.
    Closed,
    /// The retry budget is spent.
    Failed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a channel closed. Synthesized with code 1006 when the transport dies
/// without a proper close handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Abnormal closure without a close frame.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(1006, reason)
    }
}

/// Fired when a session reaches `Open`.
pub type OpenHook = Arc<dyn Fn() + Send + Sync>;
/// Fired when a session ends, voluntarily or not.
pub type CloseHook = Arc<dyn Fn(&CloseEvent) + Send + Sync>;
/// Fired for every delivered message, after heartbeat and filter handling.
pub type MessageHook = Arc<dyn Fn(&MessageRecord) + Send + Sync>;
/// Fired for every recorded error.
pub type ErrorHook = Arc<dyn Fn(&FeedError) + Send + Sync>;
/// Fired exactly once when the retry budget is spent, with the attempt count.
pub type ExhaustedHook = Arc<dyn Fn(u32) + Send + Sync>;
/// Raw-payload gate: messages it rejects are dropped before recording.
pub type FilterFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// Per-close reconnect gate consulted before scheduling a retry.
pub type ReconnectGate = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

/// Observable snapshot shared between a manager and its driver task.
#[derive(Debug)]
pub(crate) struct FeedShared {
    pub(crate) state: FeedState,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<Arc<FeedError>>,
    pub(crate) last_parsed: Option<serde_json::Value>,
    pub(crate) history: MessageHistory,
}

impl FeedShared {
    pub(crate) fn new(retention: Option<usize>) -> Self {
        Self {
            state: FeedState::Idle,
            retry_count: 0,
            last_error: None,
            last_parsed: None,
            history: MessageHistory::new(retention),
        }
    }

    /// Appends a delivery to the history. The parsed snapshot is refreshed
    /// only when the payload parsed as JSON; other traffic leaves it alone.
    pub(crate) fn record_message(&mut self, record: &MessageRecord) {
        if record.parsed.is_some() {
            self.last_parsed = record.parsed.clone();
        }
        self.history.push(record.clone());
    }
}

pub(crate) type SharedFeed = Arc<Mutex<FeedShared>>;

pub(crate) fn set_state(shared: &SharedFeed, state: FeedState) {
    shared.lock().expect("feed state lock poisoned").state = state;
}

pub(crate) fn read_state(shared: &SharedFeed) -> FeedState {
    shared.lock().expect("feed state lock poisoned").state
}

/// Stores the error on the snapshot and returns the shared handle for hooks.
pub(crate) fn record_error(shared: &SharedFeed, error: FeedError) -> Arc<FeedError> {
    let error = Arc::new(error);
    shared.lock().expect("feed state lock poisoned").last_error = Some(Arc::clone(&error));
    error
}

/// Single-driver guard plus the command channel of the running driver.
///
/// `activate` hands out a command receiver only when no driver is running,
/// which is what makes `connect()`/`start()` idempotent while a driver is
/// connecting, open, or waiting out a backoff delay.
pub(crate) struct DriverSlot<Cmd> {
    active: AtomicBool,
    commands: Mutex<Option<mpsc::UnboundedSender<Cmd>>>,
}

impl<Cmd> DriverSlot<Cmd> {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            commands: Mutex::new(None),
        }
    }

    pub(crate) fn activate(&self) -> Option<mpsc::UnboundedReceiver<Cmd>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock().expect("driver slot lock poisoned") = Some(tx);
        Some(rx)
    }

    /// Called by the driver on exit, whatever the reason.
    pub(crate) fn release(&self) {
        *self.commands.lock().expect("driver slot lock poisoned") = None;
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Delivers a command to the running driver. `false` when none is running.
    pub(crate) fn command(&self, cmd: Cmd) -> bool {
        match &*self.commands.lock().expect("driver slot lock poisoned") {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

/// Ticks the timer when present, otherwise parks forever. Lets `select!`
/// arms stay unconditional for optional timers.
pub(crate) async fn maybe_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleeps until the deadline when present, otherwise parks forever.
pub(crate) async fn maybe_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
