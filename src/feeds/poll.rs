//! # HTTP Polling Feed
//!
//! Interval-driven request loop for endpoints that only speak plain HTTP.
//! Each cycle resolves the target anew (dynamic providers are re-evaluated
//! every time) and records the JSON result of one request. Failures retry
//! with a linearly growing delay inside the cycle; a fresh cache entry
//! short-circuits the network entirely.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Method;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::backoff::RetrySchedule;
use crate::core::history::MessageRecord;
use crate::core::target::Target;
use crate::error::FeedError;

use super::{
    read_state, record_error, set_state, DriverSlot, ErrorHook, ExhaustedHook, FeedShared,
    FeedState, SharedFeed,
};

/// Predicate over a successful response that ends the polling loop.
pub type StopWhen = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Hook invoked with every fresh (non-cached) successful response.
pub type SuccessHook = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Configuration for a polling feed.
#[derive(Clone)]
pub struct PollOptions {
    /// Time between poll cycles.
    pub interval: Duration,
    /// Fire the first cycle immediately instead of waiting one interval.
    pub immediate: bool,
    /// Retry failed requests within the cycle.
    pub retry_on_error: bool,
    /// Retry budget per cycle.
    pub max_retries: u32,
    /// Base retry delay; the n-th retry waits n times this long.
    pub retry_delay: Duration,
    /// End the loop on the first failed request.
    pub stop_on_error: bool,
    /// Serve responses from cache while they are fresh.
    pub cache: bool,
    /// How long a cached response stays fresh.
    pub cache_time: Duration,
    pub method: Method,
    pub headers: HeaderMap,
    /// JSON request body, sent on every request when present.
    pub body: Option<serde_json::Value>,
    /// Cap on the message history; unbounded when `None`.
    pub history_retention: Option<usize>,
    pub stop_when: Option<StopWhen>,
    pub on_success: Option<SuccessHook>,
    pub on_error: Option<ErrorHook>,
    pub on_retries_exhausted: Option<ExhaustedHook>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            immediate: true,
            retry_on_error: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            stop_on_error: false,
            cache: false,
            cache_time: Duration::from_secs(60),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            history_retention: None,
            stop_when: None,
            on_success: None,
            on_error: None,
            on_retries_exhausted: None,
        }
    }
}

#[derive(Debug)]
enum PollCommand {
    Stop,
    RetryNow,
}

/// One fully resolved request.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

/// Request seam. The default implementation goes through reqwest; tests
/// substitute scripted fetchers.
#[async_trait]
pub trait PollFetcher: Send + Sync {
    async fn fetch(&self, request: &PollRequest) -> Result<serde_json::Value, FeedError>;
}

/// Default fetcher decoding JSON responses with reqwest.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("livefeed/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl PollFetcher for ReqwestFetcher {
    async fn fetch(&self, request: &PollRequest) -> Result<serde_json::Value, FeedError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// One cached response. `fetched_at` is the wall-clock stamp of the fetch
/// that produced it, served as `last_update` on cache hits.
#[derive(Debug)]
struct CachedPoll {
    value: serde_json::Value,
    stored_at: Instant,
    fetched_at: DateTime<Utc>,
}

/// Counters and cache shared between the manager and its driver.
#[derive(Debug, Default)]
struct PollStats {
    loading: bool,
    poll_count: u64,
    last_update: Option<DateTime<Utc>>,
    cached: Option<CachedPoll>,
}

type SharedStats = Arc<Mutex<PollStats>>;

/// Interval-driven HTTP poller.
///
/// `start()` spawns the driver; `stop()` ends the loop; `retry_now()` runs a
/// cycle ahead of schedule. The cache survives stop/start so a quick restart
/// does not hammer the endpoint.
pub struct PollFeed {
    target: Target,
    options: PollOptions,
    fetcher: Arc<dyn PollFetcher>,
    shared: SharedFeed,
    stats: SharedStats,
    slot: Arc<DriverSlot<PollCommand>>,
    shutdown: CancellationToken,
}

impl PollFeed {
    pub fn new(target: impl Into<Target>, options: PollOptions) -> Self {
        Self::with_fetcher(target, options, Arc::new(ReqwestFetcher::default()))
    }

    /// Builds the feed around a custom request implementation.
    pub fn with_fetcher(
        target: impl Into<Target>,
        options: PollOptions,
        fetcher: Arc<dyn PollFetcher>,
    ) -> Self {
        let retention = options.history_retention;
        Self {
            target: target.into(),
            options,
            fetcher,
            shared: Arc::new(Mutex::new(FeedShared::new(retention))),
            stats: Arc::new(Mutex::new(PollStats::default())),
            slot: Arc::new(DriverSlot::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts the polling loop. No-op while a driver is running or after
    /// `shutdown()`. Starting resets the poll and retry counters.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() {
            log::warn!("Poll feed is shut down; start ignored");
            return;
        }
        let Some(cmd_rx) = self.slot.activate() else {
            log::debug!("Poll driver already running; start ignored");
            return;
        };
        {
            let mut guard = self.shared.lock().expect("feed state lock poisoned");
            guard.retry_count = 0;
            guard.last_error = None;
        }
        {
            let mut stats = self.stats.lock().expect("poll stats lock poisoned");
            stats.poll_count = 0;
            stats.loading = false;
        }
        tokio::spawn(run_driver(
            self.target.clone(),
            self.options.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.shared),
            Arc::clone(&self.stats),
            Arc::clone(&self.slot),
            self.shutdown.child_token(),
            cmd_rx,
        ));
    }

    /// Ends the polling loop. Idempotent.
    pub fn stop(&self) {
        if !self.slot.command(PollCommand::Stop) {
            log::debug!("No poll driver running; stop ignored");
        }
    }

    /// Runs a poll cycle ahead of schedule and resets the retry counter.
    pub fn retry_now(&self) {
        if !self.slot.command(PollCommand::RetryNow) {
            log::debug!("No poll driver running; retry ignored");
        }
    }

    /// Tears the manager down. Unconditional, idempotent, also run on drop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> FeedState {
        read_state(&self.shared)
    }

    /// True while the polling loop is alive (including retry waits).
    pub fn is_polling(&self) -> bool {
        self.slot.is_active()
    }

    /// True while a request (or its retries) is in flight.
    pub fn loading(&self) -> bool {
        self.stats.lock().expect("poll stats lock poisoned").loading
    }

    /// Fresh responses received since the loop started. Cache hits do not
    /// count.
    pub fn poll_count(&self) -> u64 {
        self.stats.lock().expect("poll stats lock poisoned").poll_count
    }

    /// When data last changed hands, cache hits included.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.stats.lock().expect("poll stats lock poisoned").last_update
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

    /// The most recent response body.
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

impl Drop for PollFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// How a poll cycle resolved.
enum Cycle {
    Continue,
    Stop,
    Exhausted,
    Shutdown,
}

enum Wait {
    Elapsed,
    RetryNow,
    Stop,
    Shutdown,
}

#[allow(clippy::too_many_arguments)]
async fn run_driver(
    target: Target,
    options: PollOptions,
    fetcher: Arc<dyn PollFetcher>,
    shared: SharedFeed,
    stats: SharedStats,
    slot: Arc<DriverSlot<PollCommand>>,
    cancel: CancellationToken,
    mut cmd_rx: mpsc::UnboundedReceiver<PollCommand>,
) {
    drive(
        &target, &options, &fetcher, &shared, &stats, &cancel, &mut cmd_rx,
    )
    .await;
    slot.release();
}

async fn drive(
    target: &Target,
    options: &PollOptions,
    fetcher: &Arc<dyn PollFetcher>,
    shared: &SharedFeed,
    stats: &SharedStats,
    cancel: &CancellationToken,
    cmd_rx: &mut mpsc::UnboundedReceiver<PollCommand>,
) {
    set_state(shared, FeedState::Open);
    log::info!("Polling started (every {:?})", options.interval);

    if !options.immediate {
        match wait_cancellable(options.interval, cmd_rx, cancel).await {
            Wait::Elapsed | Wait::RetryNow => {}
            Wait::Stop | Wait::Shutdown => {
                set_state(shared, FeedState::Closed);
                return;
            }
        }
    }

    loop {
        match run_cycle(target, options, fetcher, shared, stats, cmd_rx, cancel).await {
            Cycle::Continue => {}
            Cycle::Stop => {
                set_state(shared, FeedState::Closed);
                log::info!("Polling stopped");
                return;
            }
            Cycle::Shutdown => {
                set_state(shared, FeedState::Closed);
                return;
            }
            Cycle::Exhausted => {
                let attempts = options.max_retries;
                log::error!("Polling giving up after {attempts} retries");
                {
                    let mut guard = shared.lock().expect("feed state lock poisoned");
                    guard.state = FeedState::Failed;
                    guard.last_error = Some(Arc::new(FeedError::RetriesExhausted(attempts)));
                }
                if let Some(hook) = &options.on_retries_exhausted {
                    hook(attempts);
                }
                return;
            }
        }

        match wait_cancellable(options.interval, cmd_rx, cancel).await {
            Wait::Elapsed => {}
            Wait::RetryNow => {
                log::debug!("Manual poll requested");
                shared.lock().expect("feed state lock poisoned").retry_count = 0;
            }
            Wait::Stop => {
                set_state(shared, FeedState::Closed);
                log::info!("Polling stopped");
                return;
            }
            Wait::Shutdown => {
                set_state(shared, FeedState::Closed);
                return;
            }
        }
    }
}

async fn run_cycle(
    target: &Target,
    options: &PollOptions,
    fetcher: &Arc<dyn PollFetcher>,
    shared: &SharedFeed,
    stats: &SharedStats,
    cmd_rx: &mut mpsc::UnboundedReceiver<PollCommand>,
    cancel: &CancellationToken,
) -> Cycle {
    if options.cache {
        let hit = {
            let stats = stats.lock().expect("poll stats lock poisoned");
            stats.cached.as_ref().and_then(|entry| {
                (entry.stored_at.elapsed() < options.cache_time)
                    .then(|| (entry.value.clone(), entry.fetched_at))
            })
        };
        if let Some((value, fetched_at)) = hit {
            log::debug!("Serving poll result from cache");
            let record = MessageRecord::from_value("poll", value);
            shared
                .lock()
                .expect("feed state lock poisoned")
                .record_message(&record);
            // A hit reports the cached fetch's own stamp, not the serve time.
            stats.lock().expect("poll stats lock poisoned").last_update = Some(fetched_at);
            return Cycle::Continue;
        }
    }

    stats.lock().expect("poll stats lock poisoned").loading = true;
    let outcome = fetch_with_retries(target, options, fetcher, shared, stats, cmd_rx, cancel).await;
    stats.lock().expect("poll stats lock poisoned").loading = false;
    outcome
}

async fn fetch_with_retries(
    target: &Target,
    options: &PollOptions,
    fetcher: &Arc<dyn PollFetcher>,
    shared: &SharedFeed,
    stats: &SharedStats,
    cmd_rx: &mut mpsc::UnboundedReceiver<PollCommand>,
    cancel: &CancellationToken,
) -> Cycle {
    let schedule = RetrySchedule::linear(options.retry_delay, options.max_retries);
    loop {
        let attempt = request_once(target, options, fetcher);
        tokio::pin!(attempt);
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Cycle::Shutdown,
                cmd = cmd_rx.recv() => match cmd {
                    Some(PollCommand::Stop) => return Cycle::Stop,
                    Some(PollCommand::RetryNow) => {
                        log::debug!("Poll already in flight; retry request ignored");
                    }
                    None => return Cycle::Shutdown,
                },
                result = &mut attempt => break result,
            }
        };

        match result {
            Ok(value) => {
                let record = MessageRecord::from_value("poll", value.clone());
                {
                    let mut guard = shared.lock().expect("feed state lock poisoned");
                    guard.retry_count = 0;
                    guard.last_error = None;
                    guard.record_message(&record);
                }
                let fetched_at = Utc::now();
                {
                    let mut stats = stats.lock().expect("poll stats lock poisoned");
                    stats.poll_count += 1;
                    stats.last_update = Some(fetched_at);
                    if options.cache {
                        stats.cached = Some(CachedPoll {
                            value: value.clone(),
                            stored_at: Instant::now(),
                            fetched_at,
                        });
                    }
                }
                if let Some(hook) = &options.on_success {
                    hook(&value);
                }
                if let Some(stop_when) = &options.stop_when {
                    if stop_when(&value) {
                        log::info!("Poll stop condition met");
                        return Cycle::Stop;
                    }
                }
                return Cycle::Continue;
            }
            Err(error) => {
                log::error!("Poll request failed: {error}");
                let error = record_error(shared, error);
                if let Some(hook) = &options.on_error {
                    hook(&error);
                }
                if options.stop_on_error {
                    return Cycle::Stop;
                }
                if !options.retry_on_error {
                    return Cycle::Continue;
                }
                let retries = {
                    let mut guard = shared.lock().expect("feed state lock poisoned");
                    guard.retry_count += 1;
                    guard.retry_count
                };
                // Linear backoff: the n-th retry waits n times the base delay.
                let delay = match schedule.delay_for(retries - 1) {
                    Some(delay) => delay,
                    None => return Cycle::Exhausted,
                };
                log::warn!(
                    "Retrying poll in {delay:?} (attempt {retries}/{})",
                    options.max_retries
                );
                match wait_cancellable(delay, cmd_rx, cancel).await {
                    Wait::Elapsed => {
                        // The budget is checked when the delay elapses, so
                        // the final retry slot still waits before giving up.
                        if schedule.delay_for(retries).is_none() {
                            return Cycle::Exhausted;
                        }
                    }
                    Wait::RetryNow => {
                        shared.lock().expect("feed state lock poisoned").retry_count = 0;
                    }
                    Wait::Stop => return Cycle::Stop,
                    Wait::Shutdown => return Cycle::Shutdown,
                }
            }
        }
    }
}

async fn request_once(
    target: &Target,
    options: &PollOptions,
    fetcher: &Arc<dyn PollFetcher>,
) -> Result<serde_json::Value, FeedError> {
    let url = target.resolve().await?;
    let request = PollRequest {
        url,
        method: options.method.clone(),
        headers: options.headers.clone(),
        body: options.body.clone(),
    };
    fetcher.fetch(&request).await
}

async fn wait_cancellable(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<PollCommand>,
    cancel: &CancellationToken,
) -> Wait {
    let wait = tokio::time::sleep(delay);
    tokio::pin!(wait);
    tokio::select! {
        _ = cancel.cancelled() => Wait::Shutdown,
        cmd = cmd_rx.recv() => match cmd {
            Some(PollCommand::Stop) => Wait::Stop,
            Some(PollCommand::RetryNow) => Wait::RetryNow,
            None => Wait::Shutdown,
        },
        _ = &mut wait => Wait::Elapsed,
    }
}
