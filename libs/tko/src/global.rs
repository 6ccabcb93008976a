//! Fleet-wide TKO counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// TKO totals shared by every tracker created from one [`crate::TkoTrackerMap`].
#[derive(Debug, Default)]
pub struct GlobalTkos {
    soft: AtomicUsize,
    hard: AtomicUsize,
}

/// Point-in-time copy of [`GlobalTkos`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TkoCounts {
    pub soft: usize,
    pub hard: usize,
}

impl GlobalTkos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one soft TKO slot. Fails once `max` slots are taken.
    pub fn try_increment_soft(&self, max: usize) -> bool {
        self.soft
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    pub fn decrement_soft(&self) {
        // Saturate so an unbalanced release cannot wrap the counter.
        let _ = self
            .soft
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn increment_hard(&self) {
        self.hard.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_hard(&self) {
        let _ = self
            .hard
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    pub fn soft(&self) -> usize {
        self.soft.load(Ordering::Acquire)
    }

    pub fn hard(&self) -> usize {
        self.hard.load(Ordering::Acquire)
    }

    pub fn counts(&self) -> TkoCounts {
        TkoCounts {
            soft: self.soft(),
            hard: self.hard(),
        }
    }
}
