//! Single-slot latest-value cell
//!
//! A background thread (network loop, MQTT callback) overwrites the slot and
//! the control loop reads it once per tick. Writers never queue: the newest
//! value replaces the previous one.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct SlotInner<T> {
    value: Mutex<T>,
    stores: AtomicU64,
}

/// Shared latest-value cell (cheap to clone, all clones see the same value)
pub struct LatestSlot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> LatestSlot<T> {
    /// Create a slot holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                value: Mutex::new(initial),
                stores: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the current value
    pub fn store(&self, value: T) {
        *self.inner.value.lock() = value;
        self.inner.stores.fetch_add(1, Ordering::Release);
    }

    /// Number of stores since creation
    pub fn stores(&self) -> u64 {
        self.inner.stores.load(Ordering::Acquire)
    }
}

impl<T: Clone> LatestSlot<T> {
    /// Copy out the current value
    pub fn load(&self) -> T {
        self.inner.value.lock().clone()
    }
}
