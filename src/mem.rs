//! Memory accounting for the write path.
//!
//! Each delta writer owns a [`MemTracker`] node; memtable inserts consume
//! against it and flushes release. Entry points install a
//! [`ScopedMemTrackerSetter`] so components that only see the thread (the
//! memtable teardown in `close()`, the flush task) can attribute their
//! allocations to the right tracker.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

/// Hierarchical byte counter with an optional limit.
///
/// Consumption propagates to the parent, so a per-writer tracker rolled up
/// under a load-level tracker lets either level trip the synchronous-flush
/// backpressure path.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    /// Byte limit; negative means unlimited.
    limit: i64,
    consumption: AtomicI64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    /// Create a root tracker. A non-positive `limit` disables limit checks.
    pub fn new(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: None,
        })
    }

    /// Create a tracker whose consumption also counts against `parent`.
    pub fn with_parent(label: impl Into<String>, limit: i64, parent: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Tracker label, for diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record `bytes` of allocation on this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        self.consumption.fetch_add(bytes, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.consume(bytes);
        }
    }

    /// Release previously consumed bytes.
    pub fn release(&self, bytes: i64) {
        self.consume(-bytes);
    }

    /// Current consumption in bytes.
    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    /// True iff this tracker has a limit and consumption exceeds it.
    pub fn limit_exceeded(&self) -> bool {
        self.limit > 0 && self.consumption() > self.limit
    }

    /// Parent tracker, if any.
    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }
}

thread_local! {
    static CURRENT_TRACKER: RefCell<Option<Arc<MemTracker>>> = const { RefCell::new(None) };
}

/// The tracker installed on the current thread, if any.
pub fn current_tracker() -> Option<Arc<MemTracker>> {
    CURRENT_TRACKER.with(|t| t.borrow().clone())
}

/// RAII guard binding a tracker to the current thread for the duration of an
/// entry point. Nested guards restore the previous binding on drop.
pub struct ScopedMemTrackerSetter {
    prev: Option<Arc<MemTracker>>,
}

impl ScopedMemTrackerSetter {
    /// Install `tracker` as the thread's current tracker.
    pub fn new(tracker: &Arc<MemTracker>) -> Self {
        let prev = CURRENT_TRACKER.with(|t| t.borrow_mut().replace(Arc::clone(tracker)));
        Self { prev }
    }
}

impl Drop for ScopedMemTrackerSetter {
    fn drop(&mut self) {
        CURRENT_TRACKER.with(|t| *t.borrow_mut() = self.prev.take());
    }
}
