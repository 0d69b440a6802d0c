//! Item sizing along the scroll axis, with memoization for computed sizes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How large each item is along the scroll axis.
#[derive(Clone)]
pub enum ItemExtent {
    /// Every item has the same extent.
    Fixed(f64),
    /// Extent is computed per index and cached after the first measurement.
    Variable(Arc<dyn Fn(usize) -> f64 + Send + Sync>),
}

impl fmt::Debug for ItemExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(extent) => f.debug_tuple("Fixed").field(extent).finish(),
            Self::Variable(_) => f.write_str("Variable(..)"),
        }
    }
}

/// Measurement store. Variable extents are computed once per index and
/// reused until invalidated; fixed extents bypass the store entirely.
#[derive(Debug, Default)]
pub struct ExtentCache {
    measured: HashMap<usize, f64>,
}

impl ExtentCache {
    pub fn resolve(&mut self, extent: &ItemExtent, index: usize) -> f64 {
        match extent {
            ItemExtent::Fixed(value) => *value,
            ItemExtent::Variable(measure) => {
                *self.measured.entry(index).or_insert_with(|| measure(index))
            }
        }
    }

    /// Drops one measurement so the next resolve re-measures it.
    pub fn invalidate(&mut self, index: usize) {
        self.measured.remove(&index);
    }

    pub fn invalidate_all(&mut self) {
        self.measured.clear();
    }

    pub fn len(&self) -> usize {
        self.measured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measured.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fixed_extents_bypass_the_store() {
        let mut cache = ExtentCache::default();
        let extent = ItemExtent::Fixed(48.0);
        assert_eq!(cache.resolve(&extent, 0), 48.0);
        assert_eq!(cache.resolve(&extent, 999), 48.0);
        assert!(cache.is_empty());
    }

    #[test]
    fn variable_extents_are_measured_once_per_index() {
        let measures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&measures);
        let extent = ItemExtent::Variable(Arc::new(move |index| {
            counter.fetch_add(1, Ordering::SeqCst);
            30.0 + (index % 3) as f64 * 10.0
        }));
        let mut cache = ExtentCache::default();

        assert_eq!(cache.resolve(&extent, 4), 40.0);
        assert_eq!(cache.resolve(&extent, 4), 40.0);
        assert_eq!(cache.resolve(&extent, 5), 50.0);
        assert_eq!(measures.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidation_forces_a_fresh_measurement() {
        let measures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&measures);
        let extent = ItemExtent::Variable(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            25.0
        }));
        let mut cache = ExtentCache::default();

        cache.resolve(&extent, 7);
        cache.invalidate(7);
        cache.resolve(&extent, 7);
        assert_eq!(measures.load(Ordering::SeqCst), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
