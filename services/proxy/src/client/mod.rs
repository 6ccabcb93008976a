//! Asynchronous client for one backend endpoint.
//!
//! An [`AsyncEndpointClient`] owns at most one connection. Requests are
//! queued as *pending* until a writer pass moves them *inflight* onto the
//! connection; the connection is opened on demand by the first request that
//! finds it down. Every request carries a deadline and always completes
//! with exactly one [`Reply`].
//!
//! Connection and queue changes are reported to a [`ClientObserver`].

mod transport;

pub use transport::{Connection, TcpTransport, Transport};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mcroute_proto::{AccessPoint, Reply, Request, ResultCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::TransportError;

/// Connection state of an [`AsyncEndpointClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Down,
    Connecting,
    Up,
}

/// Receives connection and queue events from a client.
///
/// The client holds the observer weakly and never calls it while holding an
/// internal borrow, so observers may call back into the client.
pub trait ClientObserver {
    /// The connection came up.
    fn on_up(&self) {}

    /// The connection went down. `aborting` is set when it was closed
    /// locally through [`AsyncEndpointClient::close_now`].
    fn on_down(&self, _aborting: bool) {}

    /// Pending queue length changed by `diff`.
    fn on_pending_changed(&self, _diff: i64) {}

    /// Inflight count changed by `diff`.
    fn on_inflight_changed(&self, _diff: i64) {}

    /// A writer pass is about to send `num_to_send` requests.
    fn on_write_batch(&self, _num_to_send: usize) {}
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub access_point: Arc<AccessPoint>,
    /// Zero waits for the transport's own connect timeout.
    pub connect_timeout: Duration,
    /// Requests written but unanswered; zero is unlimited.
    pub max_inflight: usize,
    /// Requests waiting to be written; zero is unlimited.
    pub max_pending: usize,
}

// =============================================================================
// Client
// =============================================================================

/// Client for one backend. Closing happens on drop.
pub struct AsyncEndpointClient {
    inner: Rc<ClientInner>,
}

impl AsyncEndpointClient {
    pub fn new(transport: Rc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                access_point: options.access_point,
                transport,
                connect_timeout: Cell::new(options.connect_timeout),
                max_inflight: Cell::new(options.max_inflight),
                max_pending: Cell::new(options.max_pending),
                state: Cell::new(ConnectionState::Down),
                connection: RefCell::new(None),
                pending: RefCell::new(VecDeque::new()),
                inflight: Cell::new(0),
                generation: Cell::new(0),
                aborted_generation: Cell::new(None),
                write_scheduled: Cell::new(false),
                connect_task: RefCell::new(None),
                close_watch: RefCell::new(None),
                observer: RefCell::new(None),
            }),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn ClientObserver>) {
        *self.inner.observer.borrow_mut() = Some(observer);
        if self.inner.state.get() == ConnectionState::Up {
            self.inner.notify(|o| o.on_up());
        }
    }

    /// Queue `request` and return a future resolving to its reply.
    ///
    /// Rejections (bad key, full pending queue) resolve immediately without
    /// touching the network. A zero `timeout` never expires.
    pub fn send(&self, request: &Request, timeout: Duration) -> impl Future<Output = Reply> + 'static {
        let queued = self.inner.enqueue(request, timeout);

        async move {
            let (rx, deadline) = match queued {
                Ok(queued) => queued,
                Err(reply) => return reply,
            };

            let received = match deadline {
                Some(deadline) => match timeout_at(deadline, rx).await {
                    Ok(received) => received,
                    Err(_) => return Reply::new(ResultCode::Timeout),
                },
                None => rx.await,
            };

            received.unwrap_or_else(|_| Reply::new(ResultCode::Aborted))
        }
    }

    /// Close the connection now. Pending requests fail with `Aborted`;
    /// the next request reconnects.
    pub fn close_now(&self) {
        self.inner.close_now();
    }

    pub fn set_throttle(&self, max_inflight: usize, max_pending: usize) {
        self.inner.max_inflight.set(max_inflight);
        self.inner.max_pending.set(max_pending);
        self.inner.schedule_write();
    }

    /// Timeout for future connection attempts.
    pub fn update_connect_timeout(&self, timeout: Duration) {
        self.inner.connect_timeout.set(timeout);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Requests queued and still awaited by a caller.
    pub fn pending_request_count(&self) -> usize {
        self.inner
            .pending
            .borrow()
            .iter()
            .filter(|p| !p.tx.is_closed())
            .count()
    }

    pub fn inflight_request_count(&self) -> usize {
        self.inner.inflight.get()
    }

    pub fn retransmits_per_kbyte(&self) -> Option<f64> {
        let connection = self.inner.connection.borrow().clone();
        connection.and_then(|c| c.retransmits_per_kbyte())
    }

    pub fn access_point(&self) -> &Arc<AccessPoint> {
        &self.inner.access_point
    }
}

impl Drop for AsyncEndpointClient {
    fn drop(&mut self) {
        self.inner.close_now();
    }
}

// =============================================================================
// Internals
// =============================================================================

struct PendingRequest {
    request: Request,
    deadline: Option<Instant>,
    tx: oneshot::Sender<Reply>,
}

type Queued = (oneshot::Receiver<Reply>, Option<Instant>);

struct ClientInner {
    access_point: Arc<AccessPoint>,
    transport: Rc<dyn Transport>,
    connect_timeout: Cell<Duration>,
    max_inflight: Cell<usize>,
    max_pending: Cell<usize>,
    state: Cell<ConnectionState>,
    connection: RefCell<Option<Rc<dyn Connection>>>,
    pending: RefCell<VecDeque<PendingRequest>>,
    inflight: Cell<usize>,
    /// Bumped on every connection attempt; results from older attempts are
    /// ignored.
    generation: Cell<u64>,
    /// Latest generation closed through `close_now`.
    aborted_generation: Cell<Option<u64>>,
    write_scheduled: Cell<bool>,
    connect_task: RefCell<Option<JoinHandle<()>>>,
    /// Waits for the current connection to close.
    close_watch: RefCell<Option<JoinHandle<()>>>,
    observer: RefCell<Option<Weak<dyn ClientObserver>>>,
}

impl ClientInner {
    fn enqueue(self: &Rc<Self>, request: &Request, timeout: Duration) -> Result<Queued, Reply> {
        if let Err(e) = request.validate_key() {
            return Err(Reply::new(ResultCode::BadKey).with_message(e.to_string()));
        }

        let max_pending = self.max_pending.get();
        if max_pending != 0 && self.pending.borrow().len() >= max_pending {
            self.purge_abandoned();
            if self.pending.borrow().len() >= max_pending {
                return Err(Reply::local_error("endpoint pending queue is full"));
            }
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().push_back(PendingRequest {
            request: request.clone(),
            deadline,
            tx,
        });
        self.notify(|o| o.on_pending_changed(1));

        match self.state.get() {
            ConnectionState::Down => self.attempt_connection(),
            ConnectionState::Up => self.schedule_write(),
            ConnectionState::Connecting => {}
        }

        Ok((rx, deadline))
    }

    /// Drop queued requests nobody is waiting for any more.
    fn purge_abandoned(&self) {
        let purged = {
            let mut pending = self.pending.borrow_mut();
            let before = pending.len();
            pending.retain(|p| !p.tx.is_closed());
            before - pending.len()
        };
        if purged > 0 {
            self.notify(|o| o.on_pending_changed(-(purged as i64)));
        }
    }

    fn attempt_connection(self: &Rc<Self>) {
        self.state.set(ConnectionState::Connecting);
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let inner = Rc::clone(self);
        let transport = Rc::clone(&self.transport);
        let access_point = Arc::clone(&self.access_point);
        let timeout = self.connect_timeout.get();

        let task = tokio::task::spawn_local(async move {
            let result = transport.connect(&access_point, timeout).await;
            inner.on_connect_result(generation, result);
        });
        *self.connect_task.borrow_mut() = Some(task);
    }

    fn on_connect_result(
        self: &Rc<Self>,
        generation: u64,
        result: Result<Rc<dyn Connection>, TransportError>,
    ) {
        if generation != self.generation.get() || self.state.get() != ConnectionState::Connecting {
            if let Ok(connection) = result {
                connection.close();
            }
            return;
        }
        self.connect_task.borrow_mut().take();

        match result {
            Ok(connection) => {
                self.watch_for_close(generation, Rc::clone(&connection));
                *self.connection.borrow_mut() = Some(connection);
                self.state.set(ConnectionState::Up);
                self.notify(|o| o.on_up());
                self.schedule_write();
            }
            Err(e) => {
                debug!(
                    backend = %self.access_point,
                    error = %e,
                    "Connect failed"
                );
                self.fail_all_pending(e.result_code());
                self.state.set(ConnectionState::Down);
                self.notify(|o| o.on_down(false));
            }
        }
    }

    /// Take the connection of `generation` down once the backend closes it.
    fn watch_for_close(self: &Rc<Self>, generation: u64, connection: Rc<dyn Connection>) {
        let inner = Rc::downgrade(self);
        let task = tokio::task::spawn_local(async move {
            connection.closed().await;
            drop(connection);
            if let Some(inner) = inner.upgrade() {
                debug!(backend = %inner.access_point, "Connection closed by backend");
                inner.shutdown_connection(generation, true);
            }
        });
        let previous = self.close_watch.borrow_mut().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_close_watch(&self) {
        let task = self.close_watch.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn schedule_write(self: &Rc<Self>) {
        if self.state.get() != ConnectionState::Up || self.write_scheduled.get() {
            return;
        }
        if self.pending.borrow().is_empty() || !self.has_inflight_room() {
            return;
        }

        self.write_scheduled.set(true);
        let inner = Rc::clone(self);
        tokio::task::spawn_local(async move { inner.push_messages() });
    }

    fn has_inflight_room(&self) -> bool {
        let max = self.max_inflight.get();
        max == 0 || self.inflight.get() < max
    }

    /// Writer pass: move as many pending requests inflight as the throttle
    /// allows.
    fn push_messages(self: &Rc<Self>) {
        self.write_scheduled.set(false);
        if self.state.get() != ConnectionState::Up {
            return;
        }
        let Some(connection) = self.connection.borrow().clone() else {
            return;
        };

        let max_inflight = self.max_inflight.get();
        let (batch, abandoned) = {
            let mut pending = self.pending.borrow_mut();
            let mut batch = Vec::new();
            let mut abandoned = 0usize;
            while max_inflight == 0 || self.inflight.get() + batch.len() < max_inflight {
                let Some(next) = pending.pop_front() else {
                    break;
                };
                if next.tx.is_closed() {
                    abandoned += 1;
                } else {
                    batch.push(next);
                }
            }
            (batch, abandoned)
        };

        let num_to_send = batch.len();
        if num_to_send + abandoned > 0 {
            self.notify(|o| o.on_pending_changed(-((num_to_send + abandoned) as i64)));
        }
        if num_to_send == 0 {
            return;
        }

        self.notify(|o| o.on_write_batch(num_to_send));
        self.inflight.set(self.inflight.get() + num_to_send);
        self.notify(|o| o.on_inflight_changed(num_to_send as i64));

        let generation = self.generation.get();
        for PendingRequest {
            request,
            deadline,
            tx,
        } in batch
        {
            let inner = Rc::clone(self);
            let connection = Rc::clone(&connection);
            tokio::task::spawn_local(async move {
                let call = connection.call(&request);
                let outcome = match deadline {
                    Some(deadline) => timeout_at(deadline, call).await.ok(),
                    None => Some(call.await),
                };
                inner.on_call_complete(generation, tx, outcome);
            });
        }
    }

    /// `outcome` is `None` when the request deadline passed first.
    fn on_call_complete(
        self: &Rc<Self>,
        generation: u64,
        tx: oneshot::Sender<Reply>,
        outcome: Option<Result<Reply, TransportError>>,
    ) {
        self.inflight.set(self.inflight.get().saturating_sub(1));
        self.notify(|o| o.on_inflight_changed(-1));

        let reply = match outcome {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                let aborted = self
                    .aborted_generation
                    .get()
                    .is_some_and(|g| generation <= g);
                if e.is_connection_failure() {
                    self.shutdown_connection(generation, true);
                }
                let code = if aborted {
                    ResultCode::Aborted
                } else {
                    e.result_code()
                };
                Reply::new(code).with_message(e.to_string())
            }
            None => {
                // Replies on an in-order connection can no longer be matched
                // to requests once one has been given up on.
                if !self.access_point.protocol().is_multiplexing() {
                    self.shutdown_connection(generation, false);
                }
                Reply::new(ResultCode::Timeout)
            }
        };

        let _ = tx.send(reply);
        self.schedule_write();
    }

    /// Tear down a broken connection of `generation` and reconnect if work
    /// is queued. `report` controls whether the observer sees it go down.
    fn shutdown_connection(self: &Rc<Self>, generation: u64, report: bool) {
        if generation != self.generation.get() || self.state.get() != ConnectionState::Up {
            return;
        }

        self.stop_close_watch();
        let connection = self.connection.borrow_mut().take();
        if let Some(connection) = connection {
            connection.close();
        }
        self.state.set(ConnectionState::Down);
        self.write_scheduled.set(false);

        if report {
            self.notify(|o| o.on_down(false));
        }

        let has_pending = !self.pending.borrow().is_empty();
        if has_pending && self.state.get() == ConnectionState::Down {
            self.attempt_connection();
        }
    }

    fn close_now(&self) {
        let was = self.state.get();
        self.aborted_generation.set(Some(self.generation.get()));

        let task = self.connect_task.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
        self.stop_close_watch();
        let connection = self.connection.borrow_mut().take();
        if let Some(connection) = connection {
            connection.close();
        }

        self.state.set(ConnectionState::Down);
        self.write_scheduled.set(false);
        self.fail_all_pending(ResultCode::Aborted);

        if was != ConnectionState::Down {
            self.notify(|o| o.on_down(true));
        }
    }

    fn fail_all_pending(&self, result: ResultCode) {
        let drained: Vec<PendingRequest> = self.pending.borrow_mut().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        self.notify(|o| o.on_pending_changed(-(drained.len() as i64)));
        for request in drained {
            let _ = request.tx.send(Reply::new(result));
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn ClientObserver)) {
        let observer = self.observer.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            f(&*observer);
        }
    }
}
