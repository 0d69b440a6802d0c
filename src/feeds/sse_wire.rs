//! # text/event-stream Wire Parser
//!
//! Incremental parser for the SSE framing: field lines accumulate into a
//! pending event, a blank line dispatches it. Byte chunks can split lines,
//! CRLF pairs, and multi-byte UTF-8 sequences at any position; the parser
//! buffers the undecoded tail and only ever emits complete events.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
    /// Event name from the `event` field. `None` means the default channel.
    pub event: Option<String>,
    /// Data payload. Multi-line `data` fields are joined with `\n`.
    pub data: String,
}

/// Incremental frame parser. Feed it chunks, collect complete events.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event_type: String,
    data: Option<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value of the `id` field, kept across dispatches. Reconnect
    /// requests echo it as the `Last-Event-ID` header.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Consumes a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            if let Some(event) = self.consume_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Extracts the next complete line, handling LF, CR, and CRLF endings.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
        if self.buf[pos] == b'\r' && pos + 1 == self.buf.len() {
            // The CR may be the first half of a CRLF split across chunks.
            return None;
        }
        let crlf = self.buf[pos] == b'\r' && self.buf[pos + 1] == b'\n';
        let consumed = pos + if crlf { 2 } else { 1 };
        let mut line: Vec<u8> = self.buf.drain(..consumed).collect();
        line.truncate(pos);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Processes one line; returns an event when the line dispatches one.
    fn consume_line(&mut self, line: &str) -> Option<WireEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment line, often used as a server keepalive.
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => self.last_id = Some(value.to_string()),
            // The backoff schedule owns reconnect timing; server retry
            // hints are skipped.
            "retry" => {}
            _ => {}
        }
        None
    }

    /// Blank-line dispatch. Without accumulated data the pending event type
    /// is discarded and nothing is emitted.
    fn dispatch(&mut self) -> Option<WireEvent> {
        let data = match self.data.take() {
            Some(data) => data,
            None => {
                self.event_type.clear();
                return None;
            }
        };
        let event = if self.event_type.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.event_type))
        };
        Some(WireEvent { event, data })
    }
}
