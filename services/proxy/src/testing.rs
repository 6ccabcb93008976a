//! In-process transport for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use mcroute_proto::{AccessPoint, Reply, Request, ResultCode};
use tokio::sync::Notify;

use crate::client::{Connection, Transport};
use crate::error::TransportError;

/// What a mock connection does with a request.
pub enum MockReply {
    Reply(Reply),
    /// Reply after a delay.
    Delay(Duration, Reply),
    /// Never answer; fails with `Aborted` once the connection is closed.
    Hang,
    /// Break the connection.
    Fail,
}

type Handler = Rc<dyn Fn(&Request) -> MockReply>;

struct MockState {
    refuse: Cell<bool>,
    hang_connect: Cell<bool>,
    refused_ports: RefCell<HashSet<u16>>,
    handler: RefCell<Handler>,
    retransmits: Cell<Option<f64>>,
    connects: Cell<usize>,
    closes: Cell<usize>,
    seen: RefCell<Vec<(u16, Request)>>,
}

/// Scriptable transport. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    state: Rc<MockState>,
}

impl MockTransport {
    /// Answers every get with `Found` and the key as value, everything else
    /// with `Stored`.
    pub fn new() -> Self {
        Self {
            state: Rc::new(MockState {
                refuse: Cell::new(false),
                hang_connect: Cell::new(false),
                refused_ports: RefCell::new(HashSet::new()),
                handler: RefCell::new(Rc::new(default_reply)),
                retransmits: Cell::new(None),
                connects: Cell::new(0),
                closes: Cell::new(0),
                seen: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn handle(&self) -> Rc<dyn Transport> {
        Rc::new(self.clone())
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.set(refuse);
    }

    /// Connects to `port` fail.
    pub fn refuse_port(&self, port: u16) {
        self.state.refused_ports.borrow_mut().insert(port);
    }

    /// Connects never complete and run into the connect timeout.
    pub fn hang_connections(&self, hang: bool) {
        self.state.hang_connect.set(hang);
    }

    pub fn set_handler(&self, handler: impl Fn(&Request) -> MockReply + 'static) {
        *self.state.handler.borrow_mut() = Rc::new(handler);
    }

    pub fn set_retransmits(&self, per_kbyte: Option<f64>) {
        self.state.retransmits.set(per_kbyte);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.get()
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.get()
    }

    /// Requests that reached a connection.
    pub fn call_count(&self) -> usize {
        self.state.seen.borrow().len()
    }

    /// Requests that reached a connection to `port`.
    pub fn calls_to(&self, port: u16) -> Vec<Request> {
        self.state
            .seen
            .borrow()
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

fn default_reply(request: &Request) -> MockReply {
    let reply = if request.op.is_get_like() {
        Reply::new(ResultCode::Found).with_value(request.key.clone().into_bytes())
    } else {
        Reply::new(ResultCode::Stored)
    };
    MockReply::Reply(reply)
}

#[async_trait(?Send)]
impl Transport for MockTransport {
    async fn connect(
        &self,
        access_point: &AccessPoint,
        timeout: Duration,
    ) -> Result<Rc<dyn Connection>, TransportError> {
        self.state.connects.set(self.state.connects.get() + 1);

        if self.state.hang_connect.get() {
            if timeout.is_zero() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(timeout).await;
            return Err(TransportError::ConnectTimeout(timeout));
        }

        let refused = self.state.refuse.get()
            || self
                .state
                .refused_ports
                .borrow()
                .contains(&access_point.port());
        if refused {
            return Err(TransportError::ConnectFailed(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }

        Ok(Rc::new(MockConnection {
            state: Rc::clone(&self.state),
            port: access_point.port(),
            closed: Cell::new(false),
            notify: Notify::new(),
        }))
    }
}

struct MockConnection {
    state: Rc<MockState>,
    port: u16,
    closed: Cell<bool>,
    notify: Notify,
}

#[async_trait(?Send)]
impl Connection for MockConnection {
    async fn call(&self, request: &Request) -> Result<Reply, TransportError> {
        if self.closed.get() {
            return Err(TransportError::Closed);
        }
        self.state
            .seen
            .borrow_mut()
            .push((self.port, request.clone()));

        let handler = Rc::clone(&*self.state.handler.borrow());
        let closed = self.notify.notified();

        match handler(request) {
            MockReply::Reply(reply) => Ok(reply),
            MockReply::Delay(delay, reply) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(reply),
                    _ = closed => Err(TransportError::Aborted),
                }
            }
            MockReply::Hang => {
                closed.await;
                Err(TransportError::Aborted)
            }
            MockReply::Fail => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.state.closes.set(self.state.closes.get() + 1);
        self.notify.notify_waiters();
    }

    fn retransmits_per_kbyte(&self) -> Option<f64> {
        self.state.retransmits.get()
    }
}
