//! # Window Engine
//!
//! Geometry for rendering long lists: given an item count, per-item extents,
//! a viewport size, and a scroll offset, computes which slice of the list to
//! materialize. The slice carries an overscan margin on both sides so fast
//! scrolling hits items that are already laid out.
//!
//! The engine also tracks scroll activity (a settling flag with a quiet
//! period) and an edge-triggered end-of-list latch that fires once per
//! crossing of the scroll-progress threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::extent::{ExtentCache, ItemExtent};

pub type ScrollHook = Arc<dyn Fn(f64) + Send + Sync>;
pub type EndReachedHook = Arc<dyn Fn() + Send + Sync>;

/// Where a targeted item lands in the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Start,
    Center,
    End,
}

/// One renderable item with its resolved geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowItem {
    pub index: usize,
    /// Leading edge, measured from the start of the content.
    pub offset: f64,
    pub extent: f64,
    /// Inside the viewport proper rather than the overscan margin.
    pub visible: bool,
}

/// The slice of the list worth materializing.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWindow {
    pub start_index: usize,
    /// Inclusive.
    pub end_index: usize,
    /// Extent of the entire list, not just the window.
    pub total_extent: f64,
    pub items: Vec<WindowItem>,
}

/// Viewport and content measurements for scrollbar math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLayout {
    pub viewport_extent: f64,
    pub content_extent: f64,
}

/// Configuration for a window engine.
#[derive(Clone)]
pub struct WindowOptions {
    /// Extra items kept rendered past each viewport edge.
    pub overscan: usize,
    /// Stand-in extent used to size the overscan margin.
    pub estimated_extent: f64,
    /// Scroll progress (0 to 1) at which the end-reached latch fires.
    pub scroll_threshold: f64,
    /// How long after the last scroll event the list counts as settled.
    pub quiet_period: Duration,
    pub on_scroll: Option<ScrollHook>,
    pub on_end_reached: Option<EndReachedHook>,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            overscan: 3,
            estimated_extent: 50.0,
            scroll_threshold: 0.9,
            quiet_period: Duration::from_millis(150),
            on_scroll: None,
            on_end_reached: None,
        }
    }
}

/// Virtual-list windowing state machine.
///
/// Purely synchronous: the host reports scroll offsets and geometry changes,
/// the engine answers with the window to render.
pub struct WindowEngine {
    item_count: usize,
    container_extent: f64,
    scroll_offset: f64,
    extent: ItemExtent,
    options: WindowOptions,
    cache: ExtentCache,
    end_armed: bool,
    last_scroll: Option<Instant>,
}

impl WindowEngine {
    pub fn new(
        item_count: usize,
        container_extent: f64,
        extent: ItemExtent,
        options: WindowOptions,
    ) -> Self {
        Self {
            item_count,
            container_extent,
            scroll_offset: 0.0,
            extent,
            options,
            cache: ExtentCache::default(),
            end_armed: true,
            last_scroll: None,
        }
    }

    /// Computes the renderable slice for the current scroll offset.
    ///
    /// Items wholly before the padded viewport are skipped; items are then
    /// admitted until their combined extent exceeds the viewport plus the
    /// overscan margin. Offsets are absolute within the content.
    pub fn window(&mut self) -> ItemWindow {
        if self.item_count == 0 {
            return ItemWindow {
                start_index: 0,
                end_index: 0,
                total_extent: 0.0,
                items: Vec::new(),
            };
        }

        let pad = self.options.overscan as f64 * self.options.estimated_extent;
        let low = (self.scroll_offset - pad).max(0.0);
        let view_low = self.scroll_offset;
        let view_high = self.scroll_offset + self.container_extent;

        let mut start_index = 0;
        let mut leading = 0.0;
        while start_index + 1 < self.item_count {
            let extent = self.cache.resolve(&self.extent, start_index);
            if leading + extent < low {
                leading += extent;
                start_index += 1;
            } else {
                break;
            }
        }

        let mut items = Vec::new();
        let mut end_index = start_index;
        let mut offset = leading;
        let mut total_extent = leading;
        let mut window_extent = 0.0;
        let mut filled = false;

        for index in start_index..self.item_count {
            let extent = self.cache.resolve(&self.extent, index);
            if !filled {
                if window_extent > self.container_extent + pad {
                    filled = true;
                } else {
                    end_index = index;
                    window_extent += extent;
                    items.push(WindowItem {
                        index,
                        offset,
                        extent,
                        visible: offset + extent > view_low && offset < view_high,
                    });
                }
            }
            total_extent += extent;
            offset += extent;
        }

        ItemWindow {
            start_index,
            end_index,
            total_extent,
            items,
        }
    }

    /// Extent of the whole list.
    pub fn total_extent(&mut self) -> f64 {
        match &self.extent {
            ItemExtent::Fixed(extent) => extent * self.item_count as f64,
            ItemExtent::Variable(_) => {
                let mut total = 0.0;
                for index in 0..self.item_count {
                    total += self.cache.resolve(&self.extent, index);
                }
                total
            }
        }
    }

    pub fn layout(&mut self) -> WindowLayout {
        WindowLayout {
            viewport_extent: self.container_extent,
            content_extent: self.total_extent(),
        }
    }

    /// Offset that puts `index` at the requested alignment, clamped to the
    /// scrollable range. `None` when the index is out of bounds. The engine
    /// itself stays put: feed the returned offset back through
    /// `handle_scroll` once the view has moved.
    pub fn scroll_to(&mut self, index: usize, alignment: Alignment) -> Option<f64> {
        if index >= self.item_count {
            return None;
        }
        let mut before = 0.0;
        for i in 0..index {
            before += self.cache.resolve(&self.extent, i);
        }
        let item_extent = self.cache.resolve(&self.extent, index);
        let mut total = before + item_extent;
        for i in index + 1..self.item_count {
            total += self.cache.resolve(&self.extent, i);
        }

        let raw = match alignment {
            Alignment::Start => before,
            Alignment::Center => before - (self.container_extent - item_extent) / 2.0,
            Alignment::End => before - self.container_extent + item_extent,
        };
        let max_scroll = (total - self.container_extent).max(0.0);
        Some(raw.clamp(0.0, max_scroll))
    }

    /// Records a scroll event: stores the offset as reported, restarts the
    /// settling clock, and re-evaluates the end-of-list latch.
    pub fn handle_scroll(&mut self, offset: f64) {
        self.scroll_offset = offset;
        self.last_scroll = Some(Instant::now());
        if let Some(hook) = &self.options.on_scroll {
            hook(offset);
        }
        self.evaluate_end_reached();
    }

    /// True until a quiet period has passed since the last scroll event.
    pub fn is_scrolling(&self) -> bool {
        self.last_scroll
            .map(|at| at.elapsed() < self.options.quiet_period)
            .unwrap_or(false)
    }

    /// Updates the item count in place. Existing measurements stay valid,
    /// so appending items does not re-measure the rest.
    pub fn set_item_count(&mut self, count: usize) {
        self.item_count = count;
        self.evaluate_end_reached();
    }

    /// Swaps the backing data wholesale: every extent is re-measured.
    pub fn items_replaced(&mut self, count: usize) {
        self.item_count = count;
        self.cache.invalidate_all();
        self.evaluate_end_reached();
    }

    pub fn set_container_extent(&mut self, extent: f64) {
        self.container_extent = extent;
        self.evaluate_end_reached();
    }

    /// Replaces the sizing strategy and drops all measurements.
    pub fn set_item_extent(&mut self, extent: ItemExtent) {
        self.extent = extent;
        self.cache.invalidate_all();
    }

    /// Re-measures a single item on the next window computation.
    pub fn invalidate_extent(&mut self, index: usize) {
        self.cache.invalidate(index);
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn container_extent(&self) -> f64 {
        self.container_extent
    }

    /// Fires the end-reached hook when scroll progress first crosses the
    /// threshold; re-arms once progress falls back below it. Lists that fit
    /// inside the container report zero progress and never fire.
    fn evaluate_end_reached(&mut self) {
        let total = self.total_extent();
        let range = total - self.container_extent;
        let progress = if range > 0.0 {
            self.scroll_offset / range
        } else {
            0.0
        };
        if progress >= self.options.scroll_threshold {
            if self.end_armed {
                self.end_armed = false;
                if let Some(hook) = &self.options.on_end_reached {
                    hook();
                }
            }
        } else {
            self.end_armed = true;
        }
    }
}
