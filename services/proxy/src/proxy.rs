//! Per-worker request dispatcher.
//!
//! [`Proxy`] owns a worker's destinations and route table and decides for
//! every inbound request whether it is processed now, queued behind its
//! priority, or refused busy. Queues drain highest priority first as
//! admitted requests finish.
//!
//! Every request is wrapped in a [`RequestContext`], which guarantees
//! exactly one reply: dropping a context that has not replied answers with a
//! local error.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use mcroute_proto::{Operation, Priority, Reply, Request, ResultCode};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::WorkerContext;
use crate::destination_map::ProxyDestinationMap;
use crate::route::{ConfigBuilder, ProxyConfig};
use crate::service_info::{self, SERVICE_INFO_PREFIX};
use crate::stats::{ProxyStats, Stat};

pub type ReplyFn = Box<dyn FnOnce(Reply)>;

/// Holds an admission slot; releasing it lets queued requests in.
struct ProcessingGuard {
    proxy: Weak<Proxy>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.finish_processing();
        }
    }
}

/// One inbound request and the continuation that answers it.
pub struct RequestContext {
    request: Request,
    priority: Priority,
    reply: Option<ReplyFn>,
    processing: Option<ProcessingGuard>,
}

impl RequestContext {
    pub fn new(request: Request, priority: Priority, reply: impl FnOnce(Reply) + 'static) -> Self {
        Self {
            request,
            priority,
            reply: Some(Box::new(reply)),
            processing: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Answer the request, then release its admission slot.
    pub fn send_reply(mut self, reply: Reply) {
        if let Some(reply_fn) = self.reply.take() {
            reply_fn(reply);
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if let Some(reply_fn) = self.reply.take() {
            reply_fn(Reply::local_error("request dropped before it was answered"));
        }
    }
}

struct WaitingRequest {
    ctx: RequestContext,
    enqueued_at: Option<Instant>,
}

/// Request dispatcher of one worker.
pub struct Proxy {
    ctx: Rc<WorkerContext>,
    destinations: ProxyDestinationMap,
    config: RefCell<Rc<ProxyConfig>>,
    waiting: RefCell<[VecDeque<WaitingRequest>; Priority::ALL.len()]>,
    num_processing: Cell<usize>,
    num_waiting: Cell<usize>,
    pumping: Cell<bool>,
    shutting_down: Cell<bool>,
    self_weak: Weak<Proxy>,
}

impl Proxy {
    /// Must be called inside the worker's `LocalSet`.
    pub fn new(ctx: Rc<WorkerContext>) -> Rc<Self> {
        let destinations = ProxyDestinationMap::new(Rc::clone(&ctx));
        if let Some(interval) = ctx.options().reset_inactive_connection_interval {
            destinations.start_reset_timer(interval);
        }

        Rc::new_cyclic(|self_weak| Proxy {
            ctx,
            destinations,
            config: RefCell::new(Rc::new(ProxyConfig::unconfigured())),
            waiting: RefCell::new(std::array::from_fn(|_| VecDeque::new())),
            num_processing: Cell::new(0),
            num_waiting: Cell::new(0),
            pumping: Cell::new(false),
            shutting_down: Cell::new(false),
            self_weak: self_weak.clone(),
        })
    }

    pub fn id(&self) -> usize {
        self.ctx.id()
    }

    pub fn context(&self) -> &Rc<WorkerContext> {
        &self.ctx
    }

    pub fn stats(&self) -> &ProxyStats {
        self.ctx.stats()
    }

    pub fn destination_map(&self) -> &ProxyDestinationMap {
        &self.destinations
    }

    pub fn num_processing(&self) -> usize {
        self.num_processing.get()
    }

    pub fn num_waiting(&self) -> usize {
        self.num_waiting.get()
    }

    pub fn waiting_len(&self, priority: Priority) -> usize {
        self.waiting.borrow()[priority.index()].len()
    }

    pub fn config(&self) -> Rc<ProxyConfig> {
        Rc::clone(&self.config.borrow())
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Process `request` now, queue it, or refuse it busy. Never blocks;
    /// `reply` is called exactly once.
    pub fn dispatch(
        &self,
        request: Request,
        priority: Priority,
        reply: impl FnOnce(Reply) + 'static,
    ) {
        let ctx = RequestContext::new(request, priority, reply);
        self.stats()
            .increment(Stat::for_operation(ctx.request.op));

        if self.shutting_down.get() {
            ctx.send_reply(Reply::local_error("worker is shutting down"));
            return;
        }

        if !self.is_rate_limited(priority, &ctx.request) {
            self.process_request(ctx);
            return;
        }

        let options = self.ctx.options();
        if options
            .proxy_max_throttled_requests
            .is_some_and(|max| self.num_waiting.get() >= max)
        {
            self.stats().increment(Stat::BusyThrottled);
            ctx.send_reply(Reply::busy().with_message("too many requests waiting"));
            return;
        }

        let enqueued_at = options.waiting_request_timeout.map(|_| Instant::now());
        self.waiting.borrow_mut()[priority.index()].push_back(WaitingRequest { ctx, enqueued_at });
        self.num_waiting.set(self.num_waiting.get() + 1);
        self.stats().increment(Stat::RequestsWaiting);
    }

    fn is_rate_limited(&self, priority: Priority, request: &Request) -> bool {
        let max_inflight = self.ctx.options().proxy_max_inflight_requests;
        if max_inflight == 0 || request.op.is_rate_limit_exempt() {
            return false;
        }
        let queue_empty = self.waiting.borrow()[priority.index()].is_empty();
        !(queue_empty && self.num_processing.get() < max_inflight)
    }

    /// Admit queued requests while there is room, highest priority first.
    pub fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }

        let options = self.ctx.options();
        let max_inflight = options.proxy_max_inflight_requests;
        for priority in Priority::ALL {
            while max_inflight == 0 || self.num_processing.get() < max_inflight {
                let next = self.waiting.borrow_mut()[priority.index()].pop_front();
                let Some(WaitingRequest { ctx, enqueued_at }) = next else {
                    break;
                };
                self.num_waiting.set(self.num_waiting.get() - 1);
                self.stats().decrement(Stat::RequestsWaiting);

                let expired = options
                    .waiting_request_timeout
                    .zip(enqueued_at)
                    .is_some_and(|(timeout, at)| at.elapsed() > timeout);
                if expired {
                    self.stats().increment(Stat::BusyWaitTimeout);
                    ctx.send_reply(Reply::busy().with_message("request waited too long"));
                    continue;
                }

                self.process_request(ctx);
            }
        }

        self.pumping.set(false);
    }

    fn finish_processing(&self) {
        self.num_processing
            .set(self.num_processing.get().saturating_sub(1));
        self.stats().decrement(Stat::RequestsProcessing);
        self.pump();
    }

    // =========================================================================
    // Processing
    // =========================================================================

    fn process_request(&self, mut ctx: RequestContext) {
        self.num_processing.set(self.num_processing.get() + 1);
        self.stats().increment(Stat::RequestsProcessing);
        ctx.processing = Some(ProcessingGuard {
            proxy: self.self_weak.clone(),
        });

        match ctx.request.op {
            Operation::Stats => {
                let reply = self.stats_reply(&ctx.request.key);
                ctx.send_reply(reply);
            }
            Operation::Version => {
                ctx.send_reply(Reply::new(ResultCode::Ok).with_value(service_info::version()));
            }
            op if op.is_get_like() && ctx.request.key.starts_with(SERVICE_INFO_PREFIX) => {
                let reply = service_info::handle(self, &ctx.request.key[SERVICE_INFO_PREFIX.len()..]);
                ctx.send_reply(reply);
            }
            _ => {
                self.stats().increment(Stat::RequestsSent);
                let config = self.config();
                tokio::task::spawn_local(async move {
                    let reply = config.root().route(&ctx.request).await;
                    ctx.send_reply(reply);
                });
            }
        }
    }

    /// `stats` with arguments returns only counters starting with them.
    fn stats_reply(&self, args: &str) -> Reply {
        let body: String = self
            .stats()
            .snapshot()
            .into_iter()
            .filter(|(name, _)| name.starts_with(args))
            .map(|(name, value)| format!("{name} {value}\n"))
            .collect();
        Reply::new(ResultCode::Ok).with_value(body)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Replace the route table. Requests already routing keep the old one.
    pub fn swap_config(&self, config: ProxyConfig) {
        let description = config.root().describe();
        let old = self.config.replace(Rc::new(config));
        drop(old);

        let stats = self.stats();
        stats.increment(Stat::ConfigSwaps);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        stats.set_value(Stat::ConfigLastSuccess, now);

        info!(
            worker = self.id(),
            root = %description,
            destinations = self.destinations.len(),
            "Swapped route config"
        );
    }

    pub fn configure(&self, builder: &ConfigBuilder) {
        let config = builder(self);
        self.swap_config(config);
    }

    /// Refuse new requests and answer queued ones with a local error.
    pub fn shutdown(&self) {
        self.shutting_down.set(true);
        let drained: Vec<WaitingRequest> = self
            .waiting
            .borrow_mut()
            .iter_mut()
            .flat_map(|queue| queue.drain(..))
            .collect();

        let count = drained.len();
        self.num_waiting.set(0);
        self.stats().set_value(Stat::RequestsWaiting, 0);
        for waiting in drained {
            waiting
                .ctx
                .send_reply(Reply::local_error("worker is shutting down"));
        }
        debug!(worker = self.id(), drained = count, "Proxy shut down");
    }
}
