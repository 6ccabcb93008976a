//! Per-worker directory of destinations and the idle-connection reaper.
//!
//! The map holds destinations weakly: routes own them, and a destination
//! unregisters itself when its last route goes away. Every registered
//! destination is in at most one of two generations, *active* (touched since
//! the last reaper tick) and *inactive*. On each tick inactive destinations
//! lose their connection and active becomes the new inactive, so a
//! connection is only closed after a full interval without use.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mcroute_proto::AccessPoint;
use mcroute_tko::OwnerId;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::context::{next_destination_id, WorkerContext};
use crate::destination::{DestinationParams, ProxyDestination};
use crate::stats::Stat;

/// Identity used to deduplicate destinations.
///
/// In-order protocols cannot mix per-request timeouts on one connection, so
/// their key includes the timeout.
pub fn destination_key(access_point: &AccessPoint, timeout: Duration) -> String {
    if access_point.protocol().is_multiplexing() {
        access_point.to_string()
    } else {
        format!("{}-{}", access_point, timeout.as_millis())
    }
}

#[derive(Default)]
struct MapState {
    destinations: HashMap<String, Weak<ProxyDestination>>,
    by_id: HashMap<OwnerId, Weak<ProxyDestination>>,
    active: HashSet<OwnerId>,
    inactive: HashSet<OwnerId>,
}

pub(crate) struct MapInner {
    ctx: Rc<WorkerContext>,
    state: RefCell<MapState>,
}

impl MapInner {
    pub(crate) fn mark_as_active(&self, id: OwnerId) {
        let mut state = self.state.borrow_mut();
        if !state.by_id.contains_key(&id) {
            return;
        }
        state.inactive.remove(&id);
        state.active.insert(id);
    }

    /// Called from the destination's drop.
    pub(crate) fn remove_destination(&self, key: &str, id: OwnerId) {
        let mut state = self.state.borrow_mut();
        state.by_id.remove(&id);
        state.active.remove(&id);
        state.inactive.remove(&id);

        // A live entry under the same key belongs to a newer destination.
        if state
            .destinations
            .get(key)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            state.destinations.remove(key);
        }
    }

    fn reset_all_inactive(&self) -> usize {
        let victims: Vec<Rc<ProxyDestination>> = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let expired = std::mem::replace(&mut state.inactive, std::mem::take(&mut state.active));
            expired
                .iter()
                .filter_map(|id| state.by_id.get(id).and_then(Weak::upgrade))
                .collect()
        };

        let closed = victims.iter().filter(|d| d.reset_inactive()).count();
        drop(victims);

        if closed > 0 {
            self.ctx
                .stats()
                .increment_by(Stat::InactiveConnectionsClosed, closed as u64);
            debug!(
                worker = self.ctx.id(),
                closed,
                "Closed inactive connections"
            );
        }
        closed
    }
}

/// Destinations of one worker, keyed by [`destination_key`].
pub struct ProxyDestinationMap {
    inner: Rc<MapInner>,
    reset_timer: RefCell<Option<JoinHandle<()>>>,
}

impl ProxyDestinationMap {
    pub fn new(ctx: Rc<WorkerContext>) -> Self {
        Self {
            inner: Rc::new(MapInner {
                ctx,
                state: RefCell::new(MapState::default()),
            }),
            reset_timer: RefCell::new(None),
        }
    }

    /// Find or create the destination for `access_point` and `timeout`.
    ///
    /// A new destination is bound to the shared tracker for its key.
    pub fn emplace(
        &self,
        access_point: Arc<AccessPoint>,
        timeout: Duration,
        qos_class: u32,
        qos_path: u32,
    ) -> Rc<ProxyDestination> {
        let key = destination_key(&access_point, timeout);

        let existing = self
            .inner
            .state
            .borrow()
            .destinations
            .get(&key)
            .and_then(Weak::upgrade);
        if let Some(existing) = existing {
            existing.update_shortest_timeout(timeout);
            return existing;
        }

        let ctx = &self.inner.ctx;
        let options = ctx.options();
        let tracker = ctx.trackers().get_or_create(
            &key,
            options.failures_until_tko,
            options.maximum_soft_tkos,
        );

        let id = next_destination_id();
        let destination = ProxyDestination::create(
            Rc::clone(ctx),
            Rc::downgrade(&self.inner),
            DestinationParams {
                id,
                key: key.clone(),
                access_point,
                timeout,
                qos_class,
                qos_path,
                tracker,
            },
        );

        let mut state = self.inner.state.borrow_mut();
        state.destinations.insert(key, Rc::downgrade(&destination));
        state.by_id.insert(id, Rc::downgrade(&destination));
        drop(state);

        destination
    }

    pub fn find(&self, key: &str) -> Option<Rc<ProxyDestination>> {
        self.inner
            .state
            .borrow()
            .destinations
            .get(key)
            .and_then(Weak::upgrade)
    }

    /// Live destinations, sorted by key.
    pub fn destinations(&self) -> Vec<Rc<ProxyDestination>> {
        let mut live: Vec<_> = self
            .inner
            .state
            .borrow()
            .destinations
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        live.sort_by(|a, b| a.key().cmp(b.key()));
        live
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .borrow()
            .destinations
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self, destination: &ProxyDestination) -> bool {
        self.generation_contains(destination, |s| &s.active)
    }

    pub fn is_inactive(&self, destination: &ProxyDestination) -> bool {
        self.generation_contains(destination, |s| &s.inactive)
    }

    fn generation_contains(
        &self,
        destination: &ProxyDestination,
        generation: impl Fn(&MapState) -> &HashSet<OwnerId>,
    ) -> bool {
        let state = self.inner.state.borrow();
        state
            .by_id
            .iter()
            .find(|(_, w)| std::ptr::eq(w.as_ptr(), destination))
            .is_some_and(|(id, _)| generation(&state).contains(id))
    }

    /// Close the connections of destinations untouched for a full
    /// generation. Returns how many connections were closed.
    pub fn reset_all_inactive(&self) -> usize {
        self.inner.reset_all_inactive()
    }

    /// Run [`ProxyDestinationMap::reset_all_inactive`] every `interval`.
    pub fn start_reset_timer(&self, interval: Duration) {
        let weak = Rc::downgrade(&self.inner);
        let timer = tokio::task::spawn_local(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.reset_all_inactive();
            }
        });

        let previous = self.reset_timer.borrow_mut().replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for ProxyDestinationMap {
    fn drop(&mut self) {
        if let Some(timer) = self.reset_timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterOptions;
    use crate::destination::DestinationState;
    use crate::testing::MockTransport;
    use mcroute_proto::{Protocol, Request};
    use mcroute_tko::TkoTrackerMap;
    use rstest::rstest;
    use tokio::task::LocalSet;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn map() -> (MockTransport, ProxyDestinationMap) {
        let transport = MockTransport::new();
        let ctx = WorkerContext::new(
            0,
            Arc::new(RouterOptions::default()),
            transport.handle(),
            Arc::new(TkoTrackerMap::new()),
        );
        (transport, ProxyDestinationMap::new(ctx))
    }

    fn ap(port: u16, protocol: Protocol) -> Arc<AccessPoint> {
        Arc::new(AccessPoint::new("10.0.0.1", port, protocol, false, false))
    }

    #[rstest]
    #[case::ascii(Protocol::Ascii, false)]
    #[case::caret(Protocol::Caret, true)]
    #[case::umbrella(Protocol::Umbrella, true)]
    fn test_key_depends_on_timeout_for_in_order_protocols(
        #[case] protocol: Protocol,
        #[case] shared: bool,
    ) {
        let ap = ap(11211, protocol);
        let short = destination_key(&ap, Duration::from_millis(100));
        let long = destination_key(&ap, Duration::from_millis(200));
        assert_eq!(short == long, shared);
    }

    #[test]
    fn test_ascii_key_format() {
        let ap = ap(11211, Protocol::Ascii);
        assert_eq!(
            destination_key(&ap, Duration::from_millis(250)),
            "10.0.0.1:11211:ascii:plain:notcompressed-250"
        );
    }

    #[test]
    fn test_emplace_deduplicates_and_forgets_dropped() {
        let (_transport, map) = map();
        let a = map.emplace(ap(1, Protocol::Ascii), TIMEOUT, 0, 0);
        let b = map.emplace(ap(1, Protocol::Ascii), TIMEOUT, 0, 0);
        let c = map.emplace(ap(1, Protocol::Ascii), TIMEOUT * 2, 0, 0);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(map.len(), 2);

        drop(a);
        assert_eq!(map.len(), 2);
        drop(b);
        assert_eq!(map.len(), 1);
        assert!(map.find(c.key()).is_some());
    }

    #[test]
    fn test_destinations_share_tracker_by_key() {
        let transport = MockTransport::new();
        let trackers = Arc::new(TkoTrackerMap::new());
        let options = Arc::new(RouterOptions::default());
        let worker_a = ProxyDestinationMap::new(WorkerContext::new(
            0,
            Arc::clone(&options),
            transport.handle(),
            Arc::clone(&trackers),
        ));
        let worker_b = ProxyDestinationMap::new(WorkerContext::new(
            1,
            options,
            transport.handle(),
            Arc::clone(&trackers),
        ));

        let a = worker_a.emplace(ap(7, Protocol::Caret), TIMEOUT, 0, 0);
        let b = worker_b.emplace(ap(7, Protocol::Caret), TIMEOUT, 0, 0);
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(a.tracker(), b.tracker()));
        assert_eq!(trackers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generations_are_exclusive() {
        LocalSet::new()
            .run_until(async {
                let (_transport, map) = map();
                let dest = map.emplace(ap(1, Protocol::Caret), TIMEOUT, 0, 0);
                assert!(!map.is_active(&dest));
                assert!(!map.is_inactive(&dest));

                dest.send(&Request::get("k"), TIMEOUT).await;
                assert!(map.is_active(&dest));
                assert!(!map.is_inactive(&dest));

                assert_eq!(map.reset_all_inactive(), 0);
                assert!(!map.is_active(&dest));
                assert!(map.is_inactive(&dest));

                dest.send(&Request::get("k"), TIMEOUT).await;
                assert!(map.is_active(&dest));
                assert!(!map.is_inactive(&dest));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_reaped_after_two_ticks() {
        LocalSet::new()
            .run_until(async {
                let (transport, map) = map();
                let interval = Duration::from_millis(100);
                map.start_reset_timer(interval);
                let dest = map.emplace(ap(1, Protocol::Caret), TIMEOUT, 0, 0);

                dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(dest.state(), DestinationState::Up);

                // First tick only demotes.
                tokio::time::sleep(Duration::from_millis(199)).await;
                assert_eq!(dest.state(), DestinationState::Up);
                assert!(map.is_inactive(&dest));

                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(dest.state(), DestinationState::Closed);
                assert_eq!(transport.close_count(), 1);
                assert!(!map.is_active(&dest) && !map.is_inactive(&dest));
                assert!(map.find(dest.key()).is_some());

                // Reconnects on demand.
                let reply = dest.send(&Request::get("k"), TIMEOUT).await;
                assert!(!reply.is_error());
                assert_eq!(transport.connect_count(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_touched_connection_survives_ticks() {
        LocalSet::new()
            .run_until(async {
                let (transport, map) = map();
                map.start_reset_timer(Duration::from_millis(100));
                let dest = map.emplace(ap(1, Protocol::Caret), TIMEOUT, 0, 0);

                for _ in 0..5 {
                    dest.send(&Request::get("k"), TIMEOUT).await;
                    tokio::time::sleep(Duration::from_millis(90)).await;
                }
                assert_eq!(dest.state(), DestinationState::Up);
                assert_eq!(transport.close_count(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_interval_touch_outlives_one_interval() {
        LocalSet::new()
            .run_until(async {
                let (transport, map) = map();
                map.start_reset_timer(Duration::from_millis(100));
                let dest = map.emplace(ap(1, Protocol::Caret), TIMEOUT, 0, 0);

                // Touched at 150ms; ticks follow at 200ms and 300ms.
                tokio::time::sleep(Duration::from_millis(150)).await;
                dest.send(&Request::get("k"), TIMEOUT).await;

                // Past one interval since the touch, still open.
                tokio::time::sleep(Duration::from_millis(149)).await;
                assert_eq!(dest.state(), DestinationState::Up);
                assert!(map.is_inactive(&dest));
                assert_eq!(transport.close_count(), 0);

                // Reaped at the second tick, inside two intervals of the touch.
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(dest.state(), DestinationState::Closed);
                assert_eq!(transport.close_count(), 1);
            })
            .await;
    }
}
