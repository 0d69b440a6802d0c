//! # Server-Sent Events Feed Manager
//!
//! One-way event stream over a long-lived HTTP GET. The driver feeds raw
//! body chunks through the wire parser and applies the same close-and-retry
//! lifecycle as the socket feed; reconnect requests carry the last seen
//! event id back as the `Last-Event-ID` header. Events on the default
//! channel are always delivered; events with an explicit name are delivered
//! only when that name was subscribed.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::backoff::RetrySchedule;
use crate::core::history::MessageRecord;
use crate::core::target::Target;
use crate::error::FeedError;

use super::sse_wire::{SseParser, WireEvent};
use super::{
    read_state, record_error, set_state, CloseEvent, CloseHook, DriverSlot, ErrorHook,
    ExhaustedHook, FeedShared, FeedState, MessageHook, OpenHook, SharedFeed,
};

/// Configuration for an event-stream feed.
#[derive(Clone)]
pub struct SseOptions {
    /// Reconnect after the stream drops.
    pub reconnect: bool,
    /// Retry budget per acquisition effort.
    pub max_reconnect_attempts: u32,
    /// Base delay of the backoff (grows by 1.5x per attempt).
    pub reconnect_interval: Duration,
    /// Named event channels to deliver in addition to the default channel.
    pub events: Vec<String>,
    /// Cap on the message history; unbounded when `None`.
    pub history_retention: Option<usize>,
    pub on_open: Option<OpenHook>,
    pub on_close: Option<CloseHook>,
    pub on_message: Option<MessageHook>,
    pub on_error: Option<ErrorHook>,
    pub on_retries_exhausted: Option<ExhaustedHook>,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(3),
            events: Vec::new(),
            history_retention: None,
            on_open: None,
            on_close: None,
            on_message: None,
            on_error: None,
            on_retries_exhausted: None,
        }
    }
}

#[derive(Debug)]
enum StreamCommand {
    Disconnect,
}

/// Stream factory seam. The default implementation issues a streaming GET
/// with reqwest; tests substitute scripted streams.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    /// Opens a stream. `last_event_id` carries the latest `id` field seen on
    /// a previous session, `None` on the first dial.
    async fn open(
        &self,
        url: &Url,
        last_event_id: Option<&str>,
    ) -> Result<Box<dyn EventStreamLink>, FeedError>;
}

/// One live response body.
#[async_trait]
pub trait EventStreamLink: Send {
    /// Next chunk of bytes. `None` means the server ended the stream.
    async fn next_chunk(&mut self) -> Option<Result<Bytes, FeedError>>;
}

/// Default connector issuing `Accept: text/event-stream` GETs.
pub struct ReqwestStreamConnector {
    client: reqwest::Client,
}

impl Default for ReqwestStreamConnector {
    fn default() -> Self {
        // A total-request timeout would cut the long-lived stream; only the
        // dial is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("livefeed/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl EventStreamConnector for ReqwestStreamConnector {
    async fn open(
        &self,
        url: &Url,
        last_event_id: Option<&str>,
    ) -> Result<Box<dyn EventStreamLink>, FeedError> {
        let mut request = self.client.get(url.clone()).header(ACCEPT, "text/event-stream");
        if let Some(id) = last_event_id.filter(|id| !id.is_empty()) {
            match HeaderValue::from_str(id) {
                Ok(value) => request = request.header("Last-Event-ID", value),
                Err(_) => log::debug!("Resume id {id:?} does not fit in a header; skipped"),
            }
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        Ok(Box::new(ReqwestStreamLink {
            stream: Box::pin(response.bytes_stream()),
        }))
    }
}

struct ReqwestStreamLink {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
}

#[async_trait]
impl EventStreamLink for ReqwestStreamLink {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, FeedError>> {
        self.stream
            .next()
            .await
            .map(|chunk| chunk.map_err(FeedError::from))
    }
}

/// Resilient server-sent-events subscription.
pub struct SseFeed {
    target: Target,
    options: SseOptions,
    connector: Arc<dyn EventStreamConnector>,
    shared: SharedFeed,
    slot: Arc<DriverSlot<StreamCommand>>,
    shutdown: CancellationToken,
}

impl SseFeed {
    pub fn new(target: impl Into<Target>, options: SseOptions) -> Self {
        Self::with_connector(target, options, Arc::new(ReqwestStreamConnector::default()))
    }

    /// Builds the feed around a custom stream factory.
    pub fn with_connector(
        target: impl Into<Target>,
        options: SseOptions,
        connector: Arc<dyn EventStreamConnector>,
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

    /// Opens the stream. No-op while a driver is running or after
    /// `shutdown()`. A manual connect resets the retry counter.
    pub fn connect(&self) {
        if self.shutdown.is_cancelled() {
            log::warn!("Event stream is shut down; connect ignored");
            return;
        }
        let Some(cmd_rx) = self.slot.activate() else {
            log::debug!("Event stream driver already running; connect ignored");
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

    /// Voluntary close: drops the stream (or cancels a pending reconnect)
    /// and never schedules another attempt. Idempotent.
    pub fn disconnect(&self) {
        if !self.slot.command(StreamCommand::Disconnect) {
            log::debug!("No event stream driver running; disconnect ignored");
        }
    }

    /// Tears the manager down. Unconditional, idempotent, also run on drop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> FeedState {
        read_state(&self.shared)
    }

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

    /// Latest event data that parsed as JSON. Events whose data is not
    /// valid JSON leave the previous value in place.
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

impl Drop for SseFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum SessionEnd {
    Shutdown,
    Voluntary,
    Dropped(CloseEvent),
}

enum Opened {
    Link(Box<dyn EventStreamLink>),
    Fail(FeedError),
    Abort,
}

async fn run_driver(
    target: Target,
    options: SseOptions,
    connector: Arc<dyn EventStreamConnector>,
    shared: SharedFeed,
    slot: Arc<DriverSlot<StreamCommand>>,
    cancel: CancellationToken,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let schedule = RetrySchedule::exponential(
        options.reconnect_interval,
        1.5,
        options.max_reconnect_attempts,
    );
    let mut last_event_id: Option<String> = None;

    'lifecycle: loop {
        set_state(&shared, FeedState::Connecting);
        log::info!("Opening event stream");

        let opened = {
            let open = open_stream(&target, &connector, last_event_id.as_deref());
            tokio::pin!(open);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        set_state(&shared, FeedState::Closed);
                        break Opened::Abort;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(StreamCommand::Disconnect) => {
                            set_state(&shared, FeedState::Closed);
                            let event = CloseEvent::new(1000, "Client disconnect");
                            if let Some(hook) = &options.on_close {
                                hook(&event);
                            }
                            break Opened::Abort;
                        }
                        None => {
                            set_state(&shared, FeedState::Closed);
                            break Opened::Abort;
                        }
                    },
                    result = &mut open => break match result {
                        Ok(link) => Opened::Link(link),
                        Err(error) => Opened::Fail(error),
                    },
                }
            }
        };

        let end = match opened {
            Opened::Abort => break 'lifecycle,
            Opened::Fail(error) => {
                log::error!("Event stream open failed: {error}");
                let error = record_error(&shared, error);
                if let Some(hook) = &options.on_error {
                    hook(&error);
                }
                SessionEnd::Dropped(CloseEvent::abnormal("connect failed"))
            }
            Opened::Link(mut link) => {
                {
                    let mut guard = shared.lock().expect("feed state lock poisoned");
                    guard.state = FeedState::Open;
                    guard.retry_count = 0;
                }
                log::info!("Event stream open");
                if let Some(hook) = &options.on_open {
                    hook();
                }
                run_session(
                    &mut link,
                    &options,
                    &shared,
                    &mut last_event_id,
                    &mut cmd_rx,
                    &cancel,
                )
                .await
            }
        };

        match end {
            SessionEnd::Shutdown => {
                set_state(&shared, FeedState::Closed);
                break 'lifecycle;
            }
            SessionEnd::Voluntary => {
                set_state(&shared, FeedState::Closed);
                log::info!("Event stream closed");
                let event = CloseEvent::new(1000, "Client disconnect");
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

                let attempt = shared.lock().expect("feed state lock poisoned").retry_count;
                match schedule.delay_for(attempt) {
                    Some(delay) => {
                        log::warn!(
                            "Event stream lost. Retry {}/{} in {:?}",
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
                        log::error!("Event stream giving up after {attempts} reconnect attempts");
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

async fn open_stream(
    target: &Target,
    connector: &Arc<dyn EventStreamConnector>,
    last_event_id: Option<&str>,
) -> Result<Box<dyn EventStreamLink>, FeedError> {
    let url = target.resolve().await?;
    connector.open(&url, last_event_id).await
}

async fn run_session(
    link: &mut Box<dyn EventStreamLink>,
    options: &SseOptions,
    shared: &SharedFeed,
    last_event_id: &mut Option<String>,
    cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let mut parser = SseParser::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Shutdown,

            chunk = link.next_chunk() => match chunk {
                Some(Ok(bytes)) => {
                    for event in parser.push(&bytes) {
                        deliver(event, options, shared);
                    }
                    if let Some(id) = parser.last_event_id() {
                        *last_event_id = Some(id.to_string());
                    }
                }
                Some(Err(error)) => {
                    log::error!("Event stream read error: {error}");
                    let error = record_error(shared, error);
                    if let Some(hook) = &options.on_error {
                        hook(&error);
                    }
                    return SessionEnd::Dropped(CloseEvent::abnormal("stream error"));
                }
                None => {
                    log::warn!("Event stream ended by remote host");
                    return SessionEnd::Dropped(CloseEvent::abnormal("stream ended"));
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCommand::Disconnect) => {
                    set_state(shared, FeedState::Closing);
                    return SessionEnd::Voluntary;
                }
                None => return SessionEnd::Shutdown,
            },
        }
    }
}

/// Channel gate, then record and notify.
fn deliver(event: WireEvent, options: &SseOptions, shared: &SharedFeed) {
    let label = event.event.unwrap_or_else(|| "message".to_string());
    if label != "message" && !options.events.contains(&label) {
        log::debug!("Skipping unsubscribed event channel {label:?}");
        return;
    }
    let record = MessageRecord::now(label, event.data);
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
    cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
    cancel: &CancellationToken,
) -> bool {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = cmd_rx.recv() => false,
        _ = &mut wait => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Clone)]
    enum StreamStep {
        Chunk(&'static str),
        End,
        Hang,
    }

    struct ScriptedStreams {
        script: Mutex<VecDeque<Result<Vec<StreamStep>, ()>>>,
        attempts: AtomicU32,
        attempt_at: Mutex<Vec<Instant>>,
        resume_ids: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedStreams {
        fn new(script: Vec<Result<Vec<StreamStep>, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attempts: AtomicU32::new(0),
                attempt_at: Mutex::new(Vec::new()),
                resume_ids: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        fn attempt_gaps(&self) -> Vec<Duration> {
            let stamps = self.attempt_at.lock().unwrap();
            stamps.windows(2).map(|w| w[1] - w[0]).collect()
        }

        fn resume_ids(&self) -> Vec<Option<String>> {
            self.resume_ids.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventStreamConnector for ScriptedStreams {
        async fn open(
            &self,
            _url: &Url,
            last_event_id: Option<&str>,
        ) -> Result<Box<dyn EventStreamLink>, FeedError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempt_at.lock().unwrap().push(Instant::now());
            self.resume_ids
                .lock()
                .unwrap()
                .push(last_event_id.map(str::to_string));
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(steps)) => Ok(Box::new(ScriptedBody {
                    steps: steps.into(),
                })),
                Some(Err(())) | None => Err(FeedError::Status(503)),
            }
        }
    }

    struct ScriptedBody {
        steps: VecDeque<StreamStep>,
    }

    #[async_trait]
    impl EventStreamLink for ScriptedBody {
        async fn next_chunk(&mut self) -> Option<Result<Bytes, FeedError>> {
            match self.steps.pop_front() {
                Some(StreamStep::Chunk(text)) => Some(Ok(Bytes::from_static(text.as_bytes()))),
                Some(StreamStep::End) => None,
                Some(StreamStep::Hang) | None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn quick_options() -> SseOptions {
        SseOptions {
            reconnect_interval: Duration::from_millis(100),
            ..SseOptions::default()
        }
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reassemble_across_chunk_boundaries() {
        let streams = ScriptedStreams::new(vec![Ok(vec![
            StreamStep::Chunk("data: he"),
            StreamStep::Chunk("llo\n\nda"),
            StreamStep::Chunk("ta: world\n\n"),
            StreamStep::Hang,
        ])]);
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            quick_options(),
            streams as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| feed.history().len() == 2).await;
        let payloads: Vec<_> = feed.history().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec!["hello", "world"]);
        feed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn named_channels_require_a_subscription() {
        let streams = ScriptedStreams::new(vec![Ok(vec![
            StreamStep::Chunk("event: price\ndata: 101.5\n\n"),
            StreamStep::Chunk("event: status\ndata: halted\n\n"),
            StreamStep::Chunk("data: plain\n\n"),
            StreamStep::Hang,
        ])]);
        let options = SseOptions {
            events: vec!["price".to_string()],
            ..quick_options()
        };
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            options,
            streams as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| feed.history().len() == 2).await;
        let records = feed.history();
        assert_eq!(records[0].event_label, "price");
        assert_eq!(records[0].payload, "101.5");
        assert_eq!(records[1].event_label, "message");
        assert_eq!(records[1].payload, "plain");
        // "plain" is not JSON, so the parsed snapshot still holds the price.
        assert_eq!(feed.last_json(), Some(serde_json::json!(101.5)));
        feed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_schedules_a_reconnect() {
        let streams = ScriptedStreams::new(vec![
            Ok(vec![StreamStep::Chunk("data: first\n\n"), StreamStep::End]),
            Ok(vec![StreamStep::Chunk("data: second\n\n"), StreamStep::Hang]),
        ]);
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            quick_options(),
            streams.clone() as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| feed.history().len() == 2).await;
        assert_eq!(streams.attempts(), 2);
        assert_eq!(streams.attempt_gaps(), vec![Duration::from_millis(100)]);
        assert_eq!(feed.state(), FeedState::Open);
        assert_eq!(feed.retry_count(), 0);
        feed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_resume_from_the_last_seen_id() {
        let streams = ScriptedStreams::new(vec![
            Ok(vec![
                StreamStep::Chunk("id: 7\ndata: first\n\n"),
                StreamStep::End,
            ]),
            Ok(vec![StreamStep::Chunk("data: second\n\n"), StreamStep::End]),
            Ok(vec![StreamStep::Hang]),
        ]);
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            quick_options(),
            streams.clone() as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| streams.attempts() == 3).await;
        // The first dial has nothing to resume from. The id seen in session
        // one rides along on every later dial, even when a session in
        // between produced no id of its own.
        assert_eq!(
            streams.resume_ids(),
            vec![None, Some("7".to_string()), Some("7".to_string())]
        );
        feed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_back_off_with_a_gentler_curve() {
        let streams = ScriptedStreams::new(vec![]);
        let options = SseOptions {
            max_reconnect_attempts: 3,
            ..quick_options()
        };
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            options,
            streams.clone() as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| feed.state() == FeedState::Failed).await;
        assert_eq!(streams.attempts(), 4);
        assert_eq!(
            streams.attempt_gaps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(225),
            ]
        );
        assert!(matches!(
            feed.last_error().as_deref(),
            Some(FeedError::RetriesExhausted(3))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_the_stream_for_good() {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closes);
        let streams = ScriptedStreams::new(vec![Ok(vec![StreamStep::Hang])]);
        let options = SseOptions {
            on_close: Some(Arc::new(move |event: &CloseEvent| {
                seen.lock().unwrap().push(event.clone());
            })),
            ..quick_options()
        };
        let feed = SseFeed::with_connector(
            "https://feed.example.com/stream",
            options,
            streams.clone() as Arc<dyn EventStreamConnector>,
        );
        feed.connect();

        wait_until(|| feed.state() == FeedState::Open).await;
        feed.disconnect();
        wait_until(|| feed.state() == FeedState::Closed).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(streams.attempts(), 1);
        assert_eq!(
            closes.lock().unwrap().as_slice(),
            &[CloseEvent::new(1000, "Client disconnect")]
        );
    }
}
