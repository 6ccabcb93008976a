//! Per-worker shared state handed to destinations and the dispatcher.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mcroute_tko::{OwnerId, TkoTrackerMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::client::Transport;
use crate::config::RouterOptions;
use crate::stats::ProxyStats;

static NEXT_DESTINATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id, used as the TKO owner of a destination.
pub(crate) fn next_destination_id() -> OwnerId {
    NEXT_DESTINATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Everything one worker's components share. Never leaves its thread.
pub struct WorkerContext {
    id: usize,
    options: Arc<RouterOptions>,
    stats: ProxyStats,
    transport: Rc<dyn Transport>,
    trackers: Arc<TkoTrackerMap>,
    rng: RefCell<StdRng>,
}

impl WorkerContext {
    pub fn new(
        id: usize,
        options: Arc<RouterOptions>,
        transport: Rc<dyn Transport>,
        trackers: Arc<TkoTrackerMap>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            options,
            stats: ProxyStats::new(),
            transport,
            trackers,
            rng: RefCell::new(StdRng::from_os_rng()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    pub fn trackers(&self) -> &Arc<TkoTrackerMap> {
        &self.trackers
    }

    /// Uniform sample in `[0, 1)`.
    pub(crate) fn random_unit(&self) -> f64 {
        self.rng.borrow_mut().random::<f64>()
    }

    /// Uniform sample in `1..=max`.
    pub(crate) fn random_factor(&self, max: u32) -> u32 {
        self.rng.borrow_mut().random_range(1..=max.max(1))
    }
}
