//! Worker threads.
//!
//! Each worker is an OS thread running a current-thread runtime inside a
//! `LocalSet`, so everything a [`Proxy`] owns stays on that thread. The
//! outside world reaches a worker only through its bounded mailbox.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use mcroute_proto::{Priority, Reply, Request};
use mcroute_tko::TkoTrackerMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use crate::client::Transport;
use crate::config::RouterOptions;
use crate::context::WorkerContext;
use crate::error::RouterError;
use crate::proxy::Proxy;
use crate::route::ConfigBuilder;

/// Creates the transport of each worker, on that worker.
pub type TransportFactory = Arc<dyn Fn() -> Rc<dyn Transport> + Send + Sync>;

/// Messages accepted by a worker.
pub enum ProxyMessage {
    Request {
        request: Request,
        priority: Priority,
        reply: oneshot::Sender<Reply>,
    },
    /// Build and install a new route table.
    Configure(ConfigBuilder),
    Stats(oneshot::Sender<Vec<(&'static str, u64)>>),
}

impl fmt::Debug for ProxyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMessage::Request {
                request, priority, ..
            } => f
                .debug_struct("Request")
                .field("op", &request.op)
                .field("key", &request.key)
                .field("priority", priority)
                .finish(),
            ProxyMessage::Configure(_) => f.write_str("Configure"),
            ProxyMessage::Stats(_) => f.write_str("Stats"),
        }
    }
}

/// Handle to one worker thread. Dropping it stops the worker.
pub struct ProxyThread {
    id: usize,
    tx: mpsc::Sender<ProxyMessage>,
    shutdown: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProxyThread {
    pub fn spawn(
        id: usize,
        options: Arc<RouterOptions>,
        trackers: Arc<TkoTrackerMap>,
        transport: TransportFactory,
    ) -> Result<Self, RouterError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RouterError::Spawn { worker: id, source })?;

        let (tx, rx) = mpsc::channel(options.client_queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread = thread::Builder::new()
            .name(format!("mcroute-proxy-{id}"))
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(
                    &runtime,
                    run_worker(id, options, trackers, transport, rx, shutdown_rx),
                );
            })
            .map_err(|source| RouterError::Spawn { worker: id, source })?;

        Ok(Self {
            id,
            tx,
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sender(&self) -> &mpsc::Sender<ProxyMessage> {
        &self.tx
    }

    /// Stop the worker and wait for its thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "Worker thread panicked");
            }
        }
    }
}

impl Drop for ProxyThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    id: usize,
    options: Arc<RouterOptions>,
    trackers: Arc<TkoTrackerMap>,
    transport: TransportFactory,
    mut rx: mpsc::Receiver<ProxyMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ctx = WorkerContext::new(id, options, transport(), trackers);
    let proxy = Proxy::new(ctx);
    let mut messages_processed = 0u64;
    info!(worker = id, "Proxy worker started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(worker = id, "Proxy worker received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        messages_processed += 1;
                        handle_message(&proxy, msg);
                    }
                    None => {
                        debug!(worker = id, "Proxy worker mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    proxy.shutdown();
    info!(
        worker = id,
        messages_processed,
        "Proxy worker stopped"
    );
}

fn handle_message(proxy: &Proxy, msg: ProxyMessage) {
    match msg {
        ProxyMessage::Request {
            request,
            priority,
            reply,
        } => proxy.dispatch(request, priority, move |r| {
            let _ = reply.send(r);
        }),
        ProxyMessage::Configure(builder) => proxy.configure(&builder),
        ProxyMessage::Stats(reply) => {
            let _ = reply.send(proxy.stats().snapshot());
        }
    }
}
