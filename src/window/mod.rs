//! # List Windowing
//!
//! Synchronous geometry for long scrollable lists: the engine keeps the
//! rendered slice small while the feed side keeps the data fresh. No async
//! machinery here; hosts call in from whatever loop drives their UI.

pub mod engine;
pub mod extent;

pub use engine::{
    Alignment, EndReachedHook, ItemWindow, ScrollHook, WindowEngine, WindowItem, WindowLayout,
    WindowOptions,
};
pub use extent::{ExtentCache, ItemExtent};
