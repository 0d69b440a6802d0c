//! # Message History
//!
//! Arrival-ordered log of everything a feed delivered. Records carry the raw
//! payload, a best-effort JSON parse, and a wall-clock receipt timestamp.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One delivered message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    /// Channel label: `"message"` for the default channel, the event name for
    /// named event-stream channels, `"poll"` for polling results.
    pub event_label: String,
    /// Raw payload exactly as the transport delivered it.
    pub payload: String,
    /// Lenient JSON parse of the payload. `None` when the payload is not
    /// valid JSON; parse failures are silent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<serde_json::Value>,
    /// Wall-clock receipt time.
    pub received_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Stamps a record with the current wall clock and a best-effort parse.
    pub fn now(event_label: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let parsed = serde_json::from_str(&payload).ok();
        Self {
            event_label: event_label.into(),
            payload,
            parsed,
            received_at: Utc::now(),
        }
    }

    /// Builds a record straight from an already-parsed value.
    pub fn from_value(event_label: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            event_label: event_label.into(),
            payload: value.to_string(),
            parsed: Some(value),
            received_at: Utc::now(),
        }
    }
}

/// Append-only message log with an optional retention cap.
///
/// Unbounded by default; with a cap the oldest records are evicted first.
/// Delivery order is preserved, nothing is deduplicated or reordered.
#[derive(Debug)]
pub struct MessageHistory {
    records: VecDeque<MessageRecord>,
    retention: Option<usize>,
}

impl MessageHistory {
    pub fn new(retention: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            retention,
        }
    }

    pub fn push(&mut self, record: MessageRecord) {
        self.records.push_back(record);
        if let Some(cap) = self.retention {
            while self.records.len() > cap {
                self.records.pop_front();
            }
        }
    }

    /// Most recent record, if any.
    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Owned copy of the log in arrival order.
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_keep_arrival_order() {
        let mut history = MessageHistory::new(None);
        history.push(MessageRecord::now("message", "first"));
        history.push(MessageRecord::now("message", "second"));
        history.push(MessageRecord::now("message", "third"));

        let payloads: Vec<_> = history.snapshot().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec!["first", "second", "third"]);
        assert_eq!(history.last().map(|r| r.payload.as_str()), Some("third"));
    }

    #[test]
    fn retention_evicts_oldest_first() {
        let mut history = MessageHistory::new(Some(2));
        history.push(MessageRecord::now("message", "a"));
        history.push(MessageRecord::now("message", "b"));
        history.push(MessageRecord::now("message", "c"));

        let payloads: Vec<_> = history.snapshot().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec!["b", "c"]);
    }

    #[test]
    fn parse_is_best_effort_and_silent() {
        let json = MessageRecord::now("message", r#"{"price": 42.5}"#);
        assert_eq!(
            json.parsed.as_ref().and_then(|v| v["price"].as_f64()),
            Some(42.5)
        );

        let plain = MessageRecord::now("message", "not json at all {");
        assert!(plain.parsed.is_none());
        assert_eq!(plain.payload, "not json at all {");
    }

    #[test]
    fn zero_retention_stores_nothing() {
        let mut history = MessageHistory::new(Some(0));
        history.push(MessageRecord::now("message", "dropped"));
        assert!(history.is_empty());
    }
}
