//! Shared machinery used by every feed transport.

pub mod backoff;
pub mod heartbeat;
pub mod history;
pub mod target;

pub use backoff::{Growth, RetrySchedule};
pub use heartbeat::{Heartbeat, HeartbeatConfig, PingPayload};
pub use history::{MessageHistory, MessageRecord};
pub use target::Target;
