//! Per-key failure tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::global::GlobalTkos;
use crate::map::Registry;

/// Identity of a reporting destination. Must be unique across all workers.
pub type OwnerId = u64;

/// Kind of TKO currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TkoKind {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy)]
struct TkoMark {
    owner: OwnerId,
    kind: TkoKind,
}

#[derive(Debug, Default)]
struct TrackerState {
    consecutive_failures: usize,
    mark: Option<TkoMark>,
}

/// Shared failure state for one destination key.
///
/// Each `record_*` method returns `true` only for the single call that
/// changed the TKO state, so exactly one reporter logs the transition and
/// drives probing.
#[derive(Debug)]
pub struct TkoTracker {
    key: String,
    failures_until_tko: usize,
    max_soft_tkos: usize,
    global: Arc<GlobalTkos>,
    tko: AtomicBool,
    state: Mutex<TrackerState>,
    registry: Weak<Registry>,
}

impl TkoTracker {
    /// Create a standalone tracker. Trackers shared between workers come from
    /// [`crate::TkoTrackerMap::get_or_create`].
    pub fn new(
        key: impl Into<String>,
        failures_until_tko: usize,
        max_soft_tkos: usize,
        global: Arc<GlobalTkos>,
    ) -> Self {
        Self::with_registry(key.into(), failures_until_tko, max_soft_tkos, global, Weak::new())
    }

    pub(crate) fn with_registry(
        key: String,
        failures_until_tko: usize,
        max_soft_tkos: usize,
        global: Arc<GlobalTkos>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            key,
            failures_until_tko: failures_until_tko.max(1),
            max_soft_tkos,
            global,
            tko: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
            registry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock-free read used before every send.
    pub fn is_tko(&self) -> bool {
        self.tko.load(Ordering::Acquire)
    }

    pub fn tko_kind(&self) -> Option<TkoKind> {
        self.lock().mark.map(|m| m.kind)
    }

    pub fn is_hard_tko(&self) -> bool {
        self.tko_kind() == Some(TkoKind::Hard)
    }

    pub fn is_soft_tko(&self) -> bool {
        self.tko_kind() == Some(TkoKind::Soft)
    }

    /// Owner of the current TKO, if any.
    pub fn owner(&self) -> Option<OwnerId> {
        self.lock().mark.map(|m| m.owner)
    }

    pub fn consecutive_failures(&self) -> usize {
        self.lock().consecutive_failures
    }

    pub fn global(&self) -> &GlobalTkos {
        &self.global
    }

    /// Record an unreachable-backend failure.
    ///
    /// Returns `true` if this call marked the key hard TKO. A hard failure
    /// reported by the owner of a soft TKO upgrades it to hard without
    /// returning `true`, since the owner is already probing.
    pub fn record_hard_failure(&self, owner: OwnerId) -> bool {
        let mut state = self.lock();

        if let Some(mark) = state.mark.as_mut() {
            if mark.owner == owner && mark.kind == TkoKind::Soft {
                mark.kind = TkoKind::Hard;
                self.global.decrement_soft();
                self.global.increment_hard();
            }
            return false;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures < self.failures_until_tko {
            return false;
        }

        state.mark = Some(TkoMark {
            owner,
            kind: TkoKind::Hard,
        });
        self.global.increment_hard();
        self.tko.store(true, Ordering::Release);
        true
    }

    /// Record a slow-backend failure.
    ///
    /// Returns `true` if this call marked the key soft TKO. Past the
    /// threshold the transition still requires a free slot in the global
    /// soft TKO budget; without one, failures keep accumulating and the next
    /// soft failure tries again.
    pub fn record_soft_failure(&self, owner: OwnerId) -> bool {
        let mut state = self.lock();

        if state.mark.is_some() {
            return false;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures < self.failures_until_tko {
            return false;
        }

        if !self.global.try_increment_soft(self.max_soft_tkos) {
            debug!(
                key = %self.key,
                failures = state.consecutive_failures,
                max_soft_tkos = self.max_soft_tkos,
                "soft TKO budget exhausted"
            );
            return false;
        }

        state.mark = Some(TkoMark {
            owner,
            kind: TkoKind::Soft,
        });
        self.tko.store(true, Ordering::Release);
        true
    }

    /// Record a successful reply.
    ///
    /// Outside TKO this resets the failure count and returns `false`. While
    /// TKO only the owner's success counts: it clears TKO and returns `true`
    /// so the owner can stop probing.
    pub fn record_success(&self, owner: OwnerId) -> bool {
        let mut state = self.lock();

        match state.mark {
            None => {
                state.consecutive_failures = 0;
                false
            }
            Some(mark) if mark.owner == owner => {
                self.unmark(&mut state, mark.kind);
                true
            }
            Some(_) => false,
        }
    }

    /// Forget `owner`, which is going away. If it owned the TKO the key is
    /// unmarked and `true` is returned.
    pub fn remove_destination(&self, owner: OwnerId) -> bool {
        let mut state = self.lock();

        match state.mark {
            Some(mark) if mark.owner == owner => {
                self.unmark(&mut state, mark.kind);
                true
            }
            _ => false,
        }
    }

    fn unmark(&self, state: &mut TrackerState, kind: TkoKind) {
        match kind {
            TkoKind::Soft => self.global.decrement_soft(),
            TkoKind::Hard => self.global.decrement_hard(),
        }
        state.mark = None;
        state.consecutive_failures = 0;
        self.tko.store(false, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TkoTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mark) = state.mark.take() {
            match mark.kind {
                TkoKind::Soft => self.global.decrement_soft(),
                TkoKind::Hard => self.global.decrement_hard(),
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
            // A replacement tracker may already live under this key.
            if map.get(&self.key).is_some_and(|w| w.strong_count() == 0) {
                map.remove(&self.key);
            }
        }
    }
}
