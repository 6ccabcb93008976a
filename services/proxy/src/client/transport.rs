//! Connection seam between the endpoint client and the network.
//!
//! The endpoint client only needs "connect" and "call one request"; the wire
//! codec behind them is pluggable. [`TcpTransport`] speaks the
//! newline-delimited JSON framing from [`mcroute_proto::codec`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use mcroute_proto::codec::{self, ReplyFrame, RequestFrame};
use mcroute_proto::{AccessPoint, Priority, Reply, Request};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::TransportError;
use crate::framing::FrameReader;

/// Opens connections to backends.
#[async_trait(?Send)]
pub trait Transport {
    /// Connect to `access_point`. A zero `timeout` waits indefinitely.
    async fn connect(
        &self,
        access_point: &AccessPoint,
        timeout: Duration,
    ) -> Result<Rc<dyn Connection>, TransportError>;
}

/// One established backend connection.
#[async_trait(?Send)]
pub trait Connection {
    /// Send `request` and wait for its reply.
    async fn call(&self, request: &Request) -> Result<Reply, TransportError>;

    /// Close the connection. Outstanding calls fail.
    fn close(&self);

    /// Resolves once the connection is closed from either end.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Recent TCP retransmits per KB written, if the transport can tell.
    fn retransmits_per_kbyte(&self) -> Option<f64> {
        None
    }
}

/// Plain TCP transport with JSON-line framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait(?Send)]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        access_point: &AccessPoint,
        timeout: Duration,
    ) -> Result<Rc<dyn Connection>, TransportError> {
        if access_point.use_ssl() {
            return Err(TransportError::Unsupported("ssl"));
        }
        if access_point.compressed() {
            return Err(TransportError::Unsupported("compression"));
        }

        let addr = access_point.host_port();
        let connect = TcpStream::connect(addr.as_str());
        let stream = if timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout))?
        }
        .map_err(TransportError::ConnectFailed)?;

        stream.set_nodelay(true)?;
        debug!(backend = %addr, "Connected to backend");

        Ok(TcpConnection::start(stream))
    }
}

type CallMap = RefCell<HashMap<u64, oneshot::Sender<Result<Reply, TransportError>>>>;

struct TcpConnection {
    writer: Mutex<OwnedWriteHalf>,
    calls: Rc<CallMap>,
    closed: Rc<watch::Sender<bool>>,
    next_id: Cell<u64>,
    reader: RefCell<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    fn start(stream: TcpStream) -> Rc<dyn Connection> {
        let (read, write) = stream.into_split();
        let calls: Rc<CallMap> = Rc::new(RefCell::new(HashMap::new()));
        let closed = Rc::new(watch::Sender::new(false));

        let reader = tokio::task::spawn_local(read_replies(
            read,
            Rc::clone(&calls),
            Rc::clone(&closed),
        ));

        Rc::new(TcpConnection {
            writer: Mutex::new(write),
            calls,
            closed,
            next_id: Cell::new(1),
            reader: RefCell::new(Some(reader)),
        })
    }
}

/// Removes the call slot if the caller stops waiting.
struct CallSlot<'a> {
    calls: &'a CallMap,
    id: u64,
}

impl Drop for CallSlot<'_> {
    fn drop(&mut self) {
        self.calls.borrow_mut().remove(&self.id);
    }
}

#[async_trait(?Send)]
impl Connection for TcpConnection {
    async fn call(&self, request: &Request) -> Result<Reply, TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        let line = codec::encode_line(&RequestFrame {
            id,
            priority: Priority::default(),
            request: request.clone(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.calls.borrow_mut().insert(id, tx);
        let _slot = CallSlot {
            calls: &*self.calls,
            id,
        };

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&line).await?;
        }

        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(reader) = self.reader.borrow_mut().take() {
            reader.abort();
        }
        fail_calls(&self.calls, || TransportError::Aborted);
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_replies(
    read: OwnedReadHalf,
    calls: Rc<CallMap>,
    closed: Rc<watch::Sender<bool>>,
) {
    let mut frames = FrameReader::new(read);

    loop {
        match frames.next_frame().await {
            Ok(Some(line)) if line.trim_ascii().is_empty() => {}
            Ok(Some(line)) => match codec::decode_line::<ReplyFrame>(line) {
                Ok(frame) => {
                    let slot = calls.borrow_mut().remove(&frame.id);
                    if let Some(tx) = slot {
                        let _ = tx.send(Ok(frame.reply));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Undecodable reply frame, closing connection");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Read from backend failed");
                break;
            }
        }
    }

    closed.send_replace(true);
    fail_calls(&calls, || TransportError::Closed);
}

fn fail_calls(calls: &CallMap, err: impl Fn() -> TransportError) {
    let drained: Vec<_> = calls.borrow_mut().drain().map(|(_, tx)| tx).collect();
    for tx in drained {
        let _ = tx.send(Err(err()));
    }
}
