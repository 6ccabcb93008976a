//! Registry handing out one shared tracker per destination key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::global::GlobalTkos;
use crate::tracker::TkoTracker;

pub(crate) type Registry = Mutex<HashMap<String, Weak<TkoTracker>>>;

/// Process-wide map from destination key to [`TkoTracker`].
///
/// Holds weak references only: a tracker lives as long as some destination
/// holds it and unregisters itself when the last one goes away.
#[derive(Debug)]
pub struct TkoTrackerMap {
    trackers: Arc<Registry>,
    global: Arc<GlobalTkos>,
}

impl Default for TkoTrackerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TkoTrackerMap {
    pub fn new() -> Self {
        Self {
            trackers: Arc::new(Mutex::new(HashMap::new())),
            global: Arc::new(GlobalTkos::new()),
        }
    }

    /// Return the live tracker for `key`, creating it with the given
    /// thresholds if there is none. Thresholds of an existing tracker are
    /// left unchanged.
    pub fn get_or_create(
        &self,
        key: &str,
        failures_until_tko: usize,
        max_soft_tkos: usize,
    ) -> Arc<TkoTracker> {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = trackers.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let tracker = Arc::new(TkoTracker::with_registry(
            key.to_string(),
            failures_until_tko,
            max_soft_tkos,
            Arc::clone(&self.global),
            Arc::downgrade(&self.trackers),
        ));
        trackers.insert(key.to_string(), Arc::downgrade(&tracker));
        tracker
    }

    /// Look up a live tracker without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<TkoTracker>> {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(Weak::upgrade)
    }

    /// Keys currently marked TKO.
    pub fn tko_keys(&self) -> Vec<String> {
        // Upgraded handles must be dropped after the lock is released: the
        // last drop of a tracker takes the registry lock.
        let live: Vec<Arc<TkoTracker>> = self
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let mut keys: Vec<String> = live
            .iter()
            .filter(|t| t.is_tko())
            .map(|t| t.key().to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global(&self) -> &Arc<GlobalTkos> {
        &self.global
    }
}
