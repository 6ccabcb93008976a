//! One backend as seen by one worker.
//!
//! A [`ProxyDestination`] lazily owns the [`AsyncEndpointClient`] for its
//! backend, feeds every reply into the shared [`TkoTracker`], and probes the
//! backend while it owns a TKO mark. Destinations are created and
//! deduplicated by the [`ProxyDestinationMap`](crate::ProxyDestinationMap).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mcroute_proto::{AccessPoint, Reply, Request, ResultCode};
use mcroute_tko::{OwnerId, TkoTracker};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{AsyncEndpointClient, ClientObserver, ClientOptions};
use crate::context::WorkerContext;
use crate::destination_map::MapInner;
use crate::stats::Stat;

/// Shortest probe backoff step.
const MIN_PROBE_DELAY: Duration = Duration::from_millis(2);

/// Samples in the latency moving average.
const LATENCY_WINDOW: f64 = 16.0;

/// Connectivity of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationState {
    /// Never connected.
    New,
    Up,
    Down,
    /// Closed locally.
    Closed,
}

impl DestinationState {
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationState::New => "new",
            DestinationState::Up => "up",
            DestinationState::Down => "down",
            DestinationState::Closed => "closed",
        }
    }

    fn stat(self) -> Stat {
        match self {
            DestinationState::New => Stat::NumServersNew,
            DestinationState::Up => Stat::NumServersUp,
            DestinationState::Down => Stat::NumServersDown,
            DestinationState::Closed => Stat::NumServersClosed,
        }
    }
}

impl fmt::Display for DestinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TkoEvent {
    MarkHardTko,
    MarkSoftTko,
    UnMarkTko,
    RemoveFromConfig,
}

impl TkoEvent {
    fn as_str(self) -> &'static str {
        match self {
            TkoEvent::MarkHardTko => "marked hard TKO",
            TkoEvent::MarkSoftTko => "marked soft TKO",
            TkoEvent::UnMarkTko => "unmarked TKO",
            TkoEvent::RemoveFromConfig => "was TKO, removed from config",
        }
    }
}

#[derive(Default)]
struct ProbeState {
    /// Set while this destination owns a TKO mark.
    active: bool,
    delay_next: Duration,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ExponentialAverage {
    value: f64,
    seeded: bool,
}

impl ExponentialAverage {
    fn insert(&mut self, sample: f64) {
        if self.seeded {
            self.value = (sample + (LATENCY_WINDOW - 1.0) * self.value) / LATENCY_WINDOW;
        } else {
            self.value = sample;
            self.seeded = true;
        }
    }
}

#[derive(Default)]
struct DestinationStats {
    avg_latency_us: ExponentialAverage,
    results: HashMap<ResultCode, u64>,
    probes_sent: u64,
    retrans_per_kbyte: Option<f64>,
}

struct RxmitState {
    threshold: u64,
    last_check: Option<Instant>,
    last_close: Option<Instant>,
}

/// A backend endpoint owned by one worker.
pub struct ProxyDestination {
    id: OwnerId,
    key: String,
    access_point: Arc<AccessPoint>,
    shortest_timeout: Cell<Duration>,
    qos_class: u32,
    qos_path: u32,
    ctx: Rc<WorkerContext>,
    map: Weak<MapInner>,
    self_weak: Weak<ProxyDestination>,
    tracker: Arc<TkoTracker>,
    client: RefCell<Option<AsyncEndpointClient>>,
    state: Cell<DestinationState>,
    probe: RefCell<ProbeState>,
    stats: RefCell<DestinationStats>,
    rxmit: RefCell<RxmitState>,
}

/// Construction arguments, filled in by the destination map.
pub(crate) struct DestinationParams {
    pub id: OwnerId,
    pub key: String,
    pub access_point: Arc<AccessPoint>,
    pub timeout: Duration,
    pub qos_class: u32,
    pub qos_path: u32,
    pub tracker: Arc<TkoTracker>,
}

impl ProxyDestination {
    pub(crate) fn create(
        ctx: Rc<WorkerContext>,
        map: Weak<MapInner>,
        params: DestinationParams,
    ) -> Rc<Self> {
        let stats = ctx.stats();
        stats.increment(Stat::NumServers);
        stats.increment(DestinationState::New.stat());
        let threshold = ctx.options().rxmit.min_reconnect_threshold;

        Rc::new_cyclic(|self_weak| ProxyDestination {
            id: params.id,
            key: params.key,
            access_point: params.access_point,
            shortest_timeout: Cell::new(params.timeout),
            qos_class: params.qos_class,
            qos_path: params.qos_path,
            ctx,
            map,
            self_weak: self_weak.clone(),
            tracker: params.tracker,
            client: RefCell::new(None),
            state: Cell::new(DestinationState::New),
            probe: RefCell::new(ProbeState::default()),
            stats: RefCell::new(DestinationStats::default()),
            rxmit: RefCell::new(RxmitState {
                threshold,
                last_check: None,
                last_close: None,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn access_point(&self) -> &Arc<AccessPoint> {
        &self.access_point
    }

    pub fn state(&self) -> DestinationState {
        self.state.get()
    }

    pub fn tracker(&self) -> &Arc<TkoTracker> {
        &self.tracker
    }

    pub fn qos(&self) -> (u32, u32) {
        (self.qos_class, self.qos_path)
    }

    /// Shortest non-zero timeout this destination was configured with.
    pub fn shortest_timeout(&self) -> Duration {
        self.shortest_timeout.get()
    }

    /// Whether routing may send here. Probes bypass this.
    pub fn may_send(&self) -> bool {
        !self.tracker.is_tko()
    }

    /// Probes sent since this destination last started probing. The
    /// `probes_sent` stat keeps the lifetime total.
    pub fn probes_sent(&self) -> u64 {
        self.stats.borrow().probes_sent
    }

    /// Moving average of reply latency.
    pub fn avg_latency(&self) -> Duration {
        let micros = self.stats.borrow().avg_latency_us.value;
        Duration::from_secs_f64(micros.max(0.0) / 1_000_000.0)
    }

    pub fn result_count(&self, result: ResultCode) -> u64 {
        self.stats
            .borrow()
            .results
            .get(&result)
            .copied()
            .unwrap_or(0)
    }

    pub fn retransmits_per_kbyte(&self) -> Option<f64> {
        self.stats.borrow().retrans_per_kbyte
    }

    pub fn pending_request_count(&self) -> usize {
        self.client
            .borrow()
            .as_ref()
            .map_or(0, AsyncEndpointClient::pending_request_count)
    }

    pub fn inflight_request_count(&self) -> usize {
        self.client
            .borrow()
            .as_ref()
            .map_or(0, AsyncEndpointClient::inflight_request_count)
    }

    /// Send `request` and report the outcome to the health tracker.
    ///
    /// The caller checks [`ProxyDestination::may_send`] first.
    pub async fn send(&self, request: &Request, timeout: Duration) -> Reply {
        self.mark_as_active();
        let start = Instant::now();
        let reply = self.client_send(request, timeout).await;
        self.on_reply(reply.result, Some(start.elapsed()));
        reply
    }

    /// Account for one reply. `latency` is `None` for replies produced
    /// without sending, such as a TKO skip.
    pub fn on_reply(&self, result: ResultCode, latency: Option<Duration>) {
        self.handle_tko(result, false);

        {
            let mut stats = self.stats.borrow_mut();
            *stats.results.entry(result).or_default() += 1;
            if let Some(latency) = latency {
                stats.avg_latency_us.insert(latency.as_secs_f64() * 1_000_000.0);
            }
        }

        self.check_rxmit();
    }

    fn client_send(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> impl Future<Output = Reply> + 'static {
        let mut slot = self.client.borrow_mut();
        let client = slot.get_or_insert_with(|| self.create_client());
        client.send(request, timeout)
    }

    fn create_client(&self) -> AsyncEndpointClient {
        let options = self.ctx.options();
        debug!(
            destination = %self.key,
            qos_class = self.qos_class,
            qos_path = self.qos_path,
            "Creating endpoint client"
        );

        let client = AsyncEndpointClient::new(
            Rc::clone(self.ctx.transport()),
            ClientOptions {
                access_point: Arc::clone(&self.access_point),
                connect_timeout: self.shortest_timeout.get(),
                max_inflight: options.target_max_inflight_requests,
                max_pending: options.target_max_pending_requests,
            },
        );
        let observer: Weak<dyn ClientObserver> = self.self_weak.clone();
        client.set_observer(observer);
        client
    }

    fn mark_as_active(&self) {
        if let Some(map) = self.map.upgrade() {
            map.mark_as_active(self.id);
        }
    }

    // =========================================================================
    // Health tracking
    // =========================================================================

    fn handle_tko(&self, result: ResultCode, is_probe: bool) {
        if self.ctx.options().disable_tko_tracking {
            return;
        }

        if result.is_error() {
            if result.is_hard_tko_error() {
                if self.tracker.record_hard_failure(self.id) {
                    self.on_tko_event(TkoEvent::MarkHardTko, result);
                    self.start_sending_probes();
                }
            } else if result.is_soft_tko_error() && self.tracker.record_soft_failure(self.id) {
                self.on_tko_event(TkoEvent::MarkSoftTko, result);
                self.start_sending_probes();
            }
            return;
        }

        // While probing only the probe's own reply may clear the mark.
        let probing = self.probe.borrow().active;
        if (!probing || is_probe) && self.tracker.record_success(self.id) {
            self.on_tko_event(TkoEvent::UnMarkTko, result);
            self.stop_sending_probes();
        }
    }

    fn on_tko_event(&self, event: TkoEvent, result: ResultCode) {
        let global = self.tracker.global().counts();
        match event {
            TkoEvent::MarkHardTko | TkoEvent::MarkSoftTko => warn!(
                destination = %self.key,
                worker = self.ctx.id(),
                result = %result,
                global_hard_tkos = global.hard,
                global_soft_tkos = global.soft,
                "Destination {}",
                event.as_str()
            ),
            TkoEvent::UnMarkTko | TkoEvent::RemoveFromConfig => info!(
                destination = %self.key,
                worker = self.ctx.id(),
                result = %result,
                global_hard_tkos = global.hard,
                global_soft_tkos = global.soft,
                "Destination {}",
                event.as_str()
            ),
        }
    }

    // =========================================================================
    // Probes
    // =========================================================================

    fn start_sending_probes(&self) {
        {
            let mut probe = self.probe.borrow_mut();
            probe.active = true;
            probe.delay_next = self.ctx.options().probe.initial_delay;
        }
        self.schedule_next_probe();
    }

    fn stop_sending_probes(&self) {
        let timer = {
            let mut probe = self.probe.borrow_mut();
            probe.active = false;
            probe.timer.take()
        };
        self.stats.borrow_mut().probes_sent = 0;
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn schedule_next_probe(&self) {
        self.mark_as_active();

        let options = &self.ctx.options().probe;
        let delay = {
            let mut probe = self.probe.borrow_mut();
            let delay = probe.delay_next;
            probe.delay_next = if probe.delay_next < MIN_PROBE_DELAY {
                MIN_PROBE_DELAY
            } else {
                probe.delay_next.mul_f64(options.backoff_factor)
            }
            .min(options.max_delay);
            delay
        };
        let jitter = self.ctx.random_unit() * (options.jitter_max - options.jitter_min)
            + options.jitter_min;
        let delay = delay.mul_f64(1.0 + jitter);

        let weak = self.self_weak.clone();
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(destination) = weak.upgrade() {
                destination.on_probe_timer();
            }
        });

        let previous = self.probe.borrow_mut().timer.replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn on_probe_timer(&self) {
        let send = {
            let mut probe = self.probe.borrow_mut();
            // This task is finishing; nothing left to abort.
            probe.timer = None;
            if !probe.active {
                return;
            }
            !std::mem::replace(&mut probe.in_flight, true)
        };

        if send {
            if let Some(this) = self.self_weak.upgrade() {
                tokio::task::spawn_local(async move { this.send_probe().await });
            }
        }
        self.schedule_next_probe();
    }

    async fn send_probe(&self) {
        self.ctx.stats().increment(Stat::ProbesSent);
        self.stats.borrow_mut().probes_sent += 1;
        debug!(destination = %self.key, "Sending probe");

        let reply = self
            .client_send(&Request::version(), self.shortest_timeout.get())
            .await;
        self.handle_tko(reply.result, true);
        self.probe.borrow_mut().in_flight = false;
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    fn set_state(&self, new: DestinationState) {
        let old = self.state.replace(new);
        if old == new {
            return;
        }

        let stats = self.ctx.stats();
        stats.decrement(old.stat());
        stats.increment(new.stat());

        debug!(
            destination = %self.key,
            from = %old,
            to = %new,
            "{} of {} destinations up",
            stats.get_value(Stat::NumServersUp),
            stats.get_value(Stat::NumServers)
        );
    }

    /// Close the connection of an idle destination; it reconnects on the
    /// next send. Returns whether there was a connection to close.
    pub(crate) fn reset_inactive(&self) -> bool {
        let client = self.client.borrow_mut().take();
        match client {
            Some(client) => {
                client.close_now();
                true
            }
            None => false,
        }
    }

    pub(crate) fn update_shortest_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let current = self.shortest_timeout.get();
        if current.is_zero() || timeout < current {
            self.shortest_timeout.set(timeout);
            if let Some(client) = self.client.borrow().as_ref() {
                client.update_connect_timeout(timeout);
            }
        }
    }

    /// Force a reconnect when the connection retransmits too much.
    fn check_rxmit(&self) {
        let options = &self.ctx.options().rxmit;
        let Some(period) = options.collect_every else {
            return;
        };

        let now = Instant::now();
        {
            let mut rxmit = self.rxmit.borrow_mut();
            if rxmit.last_check.is_some_and(|last| now <= last + period) {
                return;
            }
            rxmit.last_check = Some(now);
        }

        let rate = self
            .client
            .borrow()
            .as_ref()
            .and_then(AsyncEndpointClient::retransmits_per_kbyte);
        let Some(rate) = rate else {
            return;
        };

        let stats = self.ctx.stats();
        stats.increment_by(Stat::RetransPerKbyteSum, rate as u64);
        stats.set_max(Stat::RetransPerKbyteMax, rate as u64);
        stats.increment(Stat::RetransNumTotal);
        self.stats.borrow_mut().retrans_per_kbyte = Some(rate);

        let mut rxmit = self.rxmit.borrow_mut();
        if rxmit.threshold > 0 && rate >= rxmit.threshold as f64 {
            let holdoff = period * self.ctx.random_factor(options.holdoff_factor);
            if rxmit
                .last_close
                .is_some_and(|last| now.duration_since(last) < holdoff)
            {
                return;
            }

            rxmit.last_close = Some(now);
            let doubled = rxmit.threshold.saturating_mul(2);
            rxmit.threshold = match options.max_reconnect_threshold {
                0 => doubled,
                max => doubled.min(max),
            };
            let threshold = rxmit.threshold;
            drop(rxmit);

            stats.increment(Stat::RetransClosedConnections);
            info!(
                destination = %self.key,
                retrans_per_kbyte = rate,
                next_threshold = threshold,
                "Closing lossy connection"
            );
            if let Some(client) = self.client.borrow().as_ref() {
                client.close_now();
            }
        } else if 3.0 * rate < rxmit.threshold as f64 {
            rxmit.threshold = (rxmit.threshold / 2).max(options.min_reconnect_threshold);
        }
    }

    #[cfg(test)]
    pub(crate) fn rxmit_threshold(&self) -> u64 {
        self.rxmit.borrow().threshold
    }
}

impl ClientObserver for ProxyDestination {
    fn on_up(&self) {
        self.set_state(DestinationState::Up);
    }

    fn on_down(&self, aborting: bool) {
        if aborting {
            self.set_state(DestinationState::Closed);
        } else {
            self.set_state(DestinationState::Down);
            self.handle_tko(ResultCode::ConnectError, false);
        }
    }

    fn on_pending_changed(&self, diff: i64) {
        let stats = self.ctx.stats();
        stats.add(Stat::DestinationPendingReqs, diff);
        stats.set_max(
            Stat::DestinationMaxPendingReqs,
            stats.get_value(Stat::DestinationPendingReqs),
        );
    }

    fn on_inflight_changed(&self, diff: i64) {
        let stats = self.ctx.stats();
        stats.add(Stat::DestinationInflightReqs, diff);
        stats.set_max(
            Stat::DestinationMaxInflightReqs,
            stats.get_value(Stat::DestinationInflightReqs),
        );
    }

    fn on_write_batch(&self, num_to_send: usize) {
        let stats = self.ctx.stats();
        stats.increment(Stat::DestinationBatchesSum);
        stats.increment_by(Stat::DestinationRequestsSum, num_to_send as u64);
    }
}

impl Drop for ProxyDestination {
    fn drop(&mut self) {
        if self.tracker.remove_destination(self.id) {
            self.on_tko_event(TkoEvent::RemoveFromConfig, ResultCode::Ok);
        }
        self.stop_sending_probes();

        if let Some(map) = self.map.upgrade() {
            map.remove_destination(&self.key, self.id);
        }

        // The observer is already gone, so closing reports nothing.
        if let Some(client) = self.client.get_mut().take() {
            client.close_now();
        }

        let stats = self.ctx.stats();
        stats.decrement(self.state.get().stat());
        stats.decrement(Stat::NumServers);
    }
}

impl fmt::Debug for ProxyDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDestination")
            .field("key", &self.key)
            .field("state", &self.state.get())
            .field("tko", &self.tracker.is_tko())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProbeOptions, RouterOptions, RxmitOptions};
    use crate::destination_map::ProxyDestinationMap;
    use crate::testing::{MockReply, MockTransport};
    use mcroute_proto::{Operation, Protocol};
    use mcroute_tko::TkoTrackerMap;
    use tokio::task::LocalSet;

    const TIMEOUT: Duration = Duration::from_millis(200);

    struct Fixture {
        transport: MockTransport,
        ctx: Rc<WorkerContext>,
        map: ProxyDestinationMap,
    }

    impl Fixture {
        fn new(options: RouterOptions) -> Self {
            let transport = MockTransport::new();
            let ctx = WorkerContext::new(
                0,
                Arc::new(options),
                transport.handle(),
                Arc::new(TkoTrackerMap::new()),
            );
            let map = ProxyDestinationMap::new(Rc::clone(&ctx));
            Self {
                transport,
                ctx,
                map,
            }
        }

        fn destination(&self, port: u16, protocol: Protocol) -> Rc<ProxyDestination> {
            let ap = Arc::new(AccessPoint::new("10.0.0.1", port, protocol, false, false));
            self.map.emplace(ap, TIMEOUT, 0, 0)
        }

        fn stat(&self, stat: Stat) -> u64 {
            self.ctx.stats().get_value(stat)
        }
    }

    fn exact_probe_options(initial_delay: Duration) -> RouterOptions {
        RouterOptions {
            probe: ProbeOptions {
                initial_delay,
                max_delay: Duration::from_secs(10),
                jitter_min: 0.0,
                jitter_max: 0.0,
                ..ProbeOptions::default()
            },
            ..RouterOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_created_on_first_send() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions::default());
                let dest = fx.destination(11211, Protocol::Caret);
                assert_eq!(dest.state(), DestinationState::New);
                assert_eq!(fx.stat(Stat::NumServersNew), 1);
                assert_eq!(fx.transport.connect_count(), 0);

                let reply = dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(reply.result, ResultCode::Found);
                assert_eq!(dest.state(), DestinationState::Up);
                assert_eq!(fx.stat(Stat::NumServersNew), 0);
                assert_eq!(fx.stat(Stat::NumServersUp), 1);
                assert_eq!(dest.result_count(ResultCode::Found), 1);
                assert_eq!(fx.stat(Stat::DestinationRequestsSum), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failures_mark_tko_and_probe_clears_it() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(exact_probe_options(Duration::from_millis(100)));
                fx.transport.set_handler(|req| match req.op {
                    Operation::Version => MockReply::Reply(Reply::new(ResultCode::Ok)),
                    _ => MockReply::Reply(Reply::new(ResultCode::Shutdown)),
                });
                let dest = fx.destination(11211, Protocol::Caret);

                for _ in 0..2 {
                    dest.send(&Request::get("k"), TIMEOUT).await;
                    assert!(dest.may_send());
                }
                dest.send(&Request::get("k"), TIMEOUT).await;
                assert!(!dest.may_send());
                assert!(dest.tracker().is_hard_tko());
                assert_eq!(dest.tracker().global().hard(), 1);

                tokio::time::sleep(Duration::from_millis(99)).await;
                assert_eq!(dest.probes_sent(), 0);

                tokio::time::sleep(Duration::from_millis(2)).await;
                assert!(dest.may_send());
                assert_eq!(dest.tracker().global().hard(), 0);
                assert_eq!(fx.stat(Stat::ProbesSent), 1);
                // The per-episode count restarts with the mark cleared.
                assert_eq!(dest.probes_sent(), 0);

                // Probing stopped with the mark.
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(fx.stat(Stat::ProbesSent), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probes_back_off() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(exact_probe_options(Duration::from_millis(100)));
                fx.transport
                    .set_handler(|_| MockReply::Reply(Reply::new(ResultCode::Shutdown)));
                let dest = fx.destination(11211, Protocol::Caret);
                for _ in 0..3 {
                    dest.send(&Request::get("k"), TIMEOUT).await;
                }
                assert!(!dest.may_send());

                // Probes at 100ms, +150ms, +225ms.
                tokio::time::sleep(Duration::from_millis(101)).await;
                assert_eq!(dest.probes_sent(), 1);
                tokio::time::sleep(Duration::from_millis(148)).await;
                assert_eq!(dest.probes_sent(), 1);
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(dest.probes_sent(), 2);
                tokio::time::sleep(Duration::from_millis(226)).await;
                assert_eq!(dest.probes_sent(), 3);
                assert!(!dest.may_send());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_mark_soft_tko() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(exact_probe_options(Duration::from_secs(1)));
                fx.transport.set_handler(|_| MockReply::Hang);
                let dest = fx.destination(11211, Protocol::Caret);

                for _ in 0..3 {
                    let reply = dest.send(&Request::get("k"), TIMEOUT).await;
                    assert_eq!(reply.result, ResultCode::Timeout);
                }
                assert!(dest.tracker().is_soft_tko());
                assert_eq!(dest.tracker().global().soft(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_counts_twice() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions::default());
                fx.transport.refuse_connections(true);
                let dest = fx.destination(11211, Protocol::Caret);

                let reply = dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(reply.result, ResultCode::ConnectError);
                // Once for the connection going down, once for the request.
                assert_eq!(dest.tracker().consecutive_failures(), 2);
                assert_eq!(dest.state(), DestinationState::Down);
                assert_eq!(fx.stat(Stat::NumServersDown), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tko_tracking_can_be_disabled() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions {
                    disable_tko_tracking: true,
                    ..RouterOptions::default()
                });
                fx.transport.refuse_connections(true);
                let dest = fx.destination(11211, Protocol::Caret);

                for _ in 0..5 {
                    dest.send(&Request::get("k"), TIMEOUT).await;
                }
                assert!(dest.may_send());
                assert_eq!(dest.tracker().consecutive_failures(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions::default());
                let dest = fx.destination(11211, Protocol::Caret);

                dest.on_reply(ResultCode::ConnectError, None);
                dest.on_reply(ResultCode::ConnectError, None);
                dest.on_reply(ResultCode::Found, None);
                dest.on_reply(ResultCode::ConnectError, None);
                dest.on_reply(ResultCode::ConnectError, None);
                assert!(dest.may_send());
                assert_eq!(dest.tracker().consecutive_failures(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_connection_is_closed() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions {
                    rxmit: RxmitOptions {
                        collect_every: Some(Duration::from_secs(1)),
                        min_reconnect_threshold: 10,
                        max_reconnect_threshold: 40,
                        holdoff_factor: 1,
                    },
                    ..RouterOptions::default()
                });
                fx.transport.set_retransmits(Some(50.0));
                let dest = fx.destination(11211, Protocol::Caret);

                dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(fx.transport.close_count(), 1);
                assert_eq!(dest.state(), DestinationState::Closed);
                assert_eq!(dest.rxmit_threshold(), 20);
                assert_eq!(fx.stat(Stat::RetransClosedConnections), 1);

                // Within the collection period nothing is sampled.
                dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(fx.transport.close_count(), 1);

                tokio::time::sleep(Duration::from_millis(1100)).await;
                dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(fx.transport.close_count(), 2);
                assert_eq!(dest.rxmit_threshold(), 40);

                // A clean connection relaxes the threshold again.
                fx.transport.set_retransmits(Some(5.0));
                tokio::time::sleep(Duration::from_millis(1100)).await;
                dest.send(&Request::get("k"), TIMEOUT).await;
                assert_eq!(dest.rxmit_threshold(), 20);
                assert_eq!(fx.transport.close_count(), 2);
                assert_eq!(fx.stat(Stat::RetransNumTotal), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unregisters_and_releases_tko() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(exact_probe_options(Duration::from_secs(1)));
                let dest = fx.destination(11211, Protocol::Caret);
                for _ in 0..3 {
                    dest.on_reply(ResultCode::ConnectError, None);
                }
                assert_eq!(fx.ctx.trackers().global().hard(), 1);
                let key = dest.key().to_string();

                drop(dest);
                assert!(fx.map.find(&key).is_none());
                assert_eq!(fx.ctx.trackers().global().hard(), 0);
                assert_eq!(fx.ctx.trackers().len(), 0);
                assert_eq!(fx.stat(Stat::NumServers), 0);
                assert_eq!(fx.stat(Stat::NumServersNew), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortest_timeout_wins() {
        LocalSet::new()
            .run_until(async {
                let fx = Fixture::new(RouterOptions::default());
                let ap = Arc::new(AccessPoint::new("10.0.0.1", 5000, Protocol::Caret, false, false));
                let a = fx.map.emplace(Arc::clone(&ap), Duration::from_millis(500), 0, 0);
                let b = fx.map.emplace(Arc::clone(&ap), Duration::from_millis(200), 0, 0);
                let c = fx.map.emplace(ap, Duration::ZERO, 0, 0);

                assert!(Rc::ptr_eq(&a, &b));
                assert!(Rc::ptr_eq(&a, &c));
                assert_eq!(a.shortest_timeout(), Duration::from_millis(200));
            })
            .await;
    }

    #[test]
    fn test_latency_average_seeds_then_smooths() {
        let mut avg = ExponentialAverage::default();
        avg.insert(160.0);
        assert_eq!(avg.value, 160.0);
        avg.insert(0.0);
        assert_eq!(avg.value, 150.0);
    }
}
