//! # Window Engine Integration Tests
//!
//! Walks the engine through the life of a feed-backed list: scroll to the
//! bottom, load more, scroll again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use livefeed::{Alignment, ItemExtent, WindowEngine, WindowOptions};

#[test]
fn window_engine_follows_a_growing_list() {
    let loads = Arc::new(AtomicUsize::new(0));
    let load_count = Arc::clone(&loads);
    let options = WindowOptions {
        on_end_reached: Some(Arc::new(move || {
            load_count.fetch_add(1, Ordering::SeqCst);
        })),
        ..WindowOptions::default()
    };
    let mut engine = WindowEngine::new(50, 400.0, ItemExtent::Fixed(40.0), options);

    // 50 items of 40 make 2000; the latch trips at 90% of the 1600 range.
    engine.handle_scroll(1500.0);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    // The "feed" delivers another page; progress drops and the latch re-arms.
    engine.set_item_count(100);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    let target = engine.scroll_to(99, Alignment::End);
    assert_eq!(target, Some(3600.0));
    engine.handle_scroll(3600.0);
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    let window = engine.window();
    assert_eq!(window.end_index, 99);
    assert_eq!(window.total_extent, 4000.0);
    let last = window.items.last().unwrap();
    assert_eq!(last.index, 99);
    assert!(last.visible);
}
