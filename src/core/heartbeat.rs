//! # Heartbeat Sub-Protocol
//!
//! Application-level ping/pong bookkeeping for the WebSocket transport. The
//! driver owns the actual timers; this structure only tracks whether a pong
//! deadline is armed and whether an incoming payload settles it.
//!
//! A deadline is armed when a ping goes out with a response marker
//! configured and cleared when a matching response arrives. Without a marker
//! the pings are pure keepalive traffic and nothing is ever armed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Source of the ping payload: a fixed string or a closure evaluated per ping.
#[derive(Clone)]
pub enum PingPayload {
    /// The same payload on every ping.
    Text(String),
    /// A fresh payload per ping (sequence numbers, timestamps).
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl PingPayload {
    fn render(&self) -> String {
        match self {
            PingPayload::Text(text) => text.clone(),
            PingPayload::Dynamic(producer) => producer(),
        }
    }
}

// Closures have no useful Debug output; show the variant only.
impl fmt::Debug for PingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingPayload::Text(text) => f.debug_tuple("Text").field(text).finish(),
            PingPayload::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Heartbeat settings for a socket feed.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Payload sent on each ping.
    pub message: PingPayload,
    /// Cadence between pings. The first ping goes out immediately on open.
    pub interval: Duration,
    /// How long to wait for a matching response before the channel is
    /// declared dead. Only armed when `response_message` is set.
    pub pong_timeout: Duration,
    /// Exact payload that settles an outstanding deadline. Matching messages
    /// are consumed by the heartbeat and never delivered as data.
    pub response_message: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            message: PingPayload::Text("ping".to_string()),
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            response_message: None,
        }
    }
}

/// Per-session heartbeat state.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            deadline: None,
        }
    }

    /// Cadence between pings.
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Deadline the driver should wake at, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Renders the next ping payload and re-arms the pong deadline when a
    /// response marker is configured. Every ping pushes the deadline out.
    pub fn ping(&mut self) -> String {
        if self.config.response_message.is_some() {
            self.deadline = Some(Instant::now() + self.config.pong_timeout);
        }
        self.config.message.render()
    }

    /// Inspects an incoming payload. Returns `true` when it matches the
    /// response marker: the deadline is cleared and the payload must not be
    /// delivered as data. Non-matching traffic never touches the deadline.
    pub fn settle(&mut self, raw: &str) -> bool {
        match &self.config.response_message {
            Some(expected) if expected == raw => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Timeout used for error reporting.
    pub fn pong_timeout(&self) -> Duration {
        self.config.pong_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(response: Option<&str>) -> HeartbeatConfig {
        HeartbeatConfig {
            message: PingPayload::Text("ping".into()),
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            response_message: response.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ping_arms_deadline_only_with_marker() {
        let mut keepalive = Heartbeat::new(config(None));
        assert_eq!(keepalive.ping(), "ping");
        assert!(keepalive.deadline().is_none());

        let mut guarded = Heartbeat::new(config(Some("pong")));
        guarded.ping();
        let deadline = guarded.deadline().expect("deadline armed");
        assert_eq!(deadline - Instant::now(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn matching_response_settles_and_is_consumed() {
        let mut hb = Heartbeat::new(config(Some("pong")));
        hb.ping();
        assert!(hb.deadline().is_some());

        assert!(hb.settle("pong"));
        assert!(hb.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn other_traffic_never_touches_the_deadline() {
        let mut hb = Heartbeat::new(config(Some("pong")));
        hb.ping();
        let armed = hb.deadline();

        assert!(!hb.settle("quote update"));
        assert_eq!(hb.deadline(), armed);
    }

    #[tokio::test(start_paused = true)]
    async fn each_ping_pushes_the_deadline_out() {
        let mut hb = Heartbeat::new(config(Some("pong")));
        hb.ping();
        let first = hb.deadline().expect("armed");

        tokio::time::advance(Duration::from_secs(5)).await;
        hb.ping();
        let second = hb.deadline().expect("re-armed");
        assert_eq!(second - first, Duration::from_secs(5));
    }

    #[test]
    fn dynamic_payloads_render_per_ping() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seq = Arc::clone(&counter);
        let mut hb = Heartbeat::new(HeartbeatConfig {
            message: PingPayload::Dynamic(Arc::new(move || {
                let n = seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                format!("ping:{n}")
            })),
            ..HeartbeatConfig::default()
        });
        assert_eq!(hb.ping(), "ping:0");
        assert_eq!(hb.ping(), "ping:1");
    }
}
