//! # livefeed
//!
//! Resilient data-feed managers and list-windowing geometry for streaming
//! front ends. WebSocket, server-sent-event, and HTTP-polling transports
//! share one observable surface (connection state, retry counter, last
//! error, message history); the window engine turns scroll offsets into the
//! small slice of a long list worth rendering.

// Declare the modules to re-export
pub mod core;
pub mod error;
pub mod feeds;
pub mod window;

// Re-export the working surface
pub use self::core::{
    Growth, Heartbeat, HeartbeatConfig, MessageHistory, MessageRecord, PingPayload, RetrySchedule,
    Target,
};
pub use error::{FeedError, SendOutcome};
pub use feeds::event_stream::{SseFeed, SseOptions};
pub use feeds::poll::{PollFeed, PollOptions, PollRequest};
pub use feeds::socket::{SocketFeed, SocketOptions};
pub use feeds::{CloseEvent, FeedState};
pub use window::{
    Alignment, ItemExtent, ItemWindow, WindowEngine, WindowItem, WindowLayout, WindowOptions,
};
