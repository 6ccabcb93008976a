//! The router: a set of workers sharing one TKO tracker map.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mcroute_proto::{Priority, Reply, Request};
use mcroute_tko::TkoTrackerMap;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::client::{TcpTransport, Transport};
use crate::config::RouterOptions;
use crate::error::RouterError;
use crate::route::ConfigBuilder;
use crate::worker::{ProxyMessage, ProxyThread, TransportFactory};

pub struct Router {
    options: Arc<RouterOptions>,
    trackers: Arc<TkoTrackerMap>,
    workers: Vec<ProxyThread>,
    next_worker: AtomicUsize,
}

impl Router {
    /// Start `options.num_proxies` workers speaking [`TcpTransport`].
    pub fn new(options: RouterOptions) -> Result<Self, RouterError> {
        Self::with_transport(options, Arc::new(|| Rc::new(TcpTransport) as Rc<dyn Transport>))
    }

    pub fn with_transport(
        options: RouterOptions,
        transport: TransportFactory,
    ) -> Result<Self, RouterError> {
        options.validate()?;
        let options = Arc::new(options);
        let trackers = Arc::new(TkoTrackerMap::new());

        let workers = (0..options.num_proxies)
            .map(|id| {
                ProxyThread::spawn(
                    id,
                    Arc::clone(&options),
                    Arc::clone(&trackers),
                    Arc::clone(&transport),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(num_proxies = workers.len(), "Router started");

        Ok(Self {
            options,
            trackers,
            workers,
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn trackers(&self) -> &Arc<TkoTrackerMap> {
        &self.trackers
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// A client bound to the next worker, round robin.
    pub fn client(&self) -> RouterClient {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        RouterClient {
            worker: worker.id(),
            tx: worker.sender().clone(),
        }
    }

    /// Install a route table on every worker.
    pub async fn configure(&self, builder: ConfigBuilder) -> Result<(), RouterError> {
        for worker in &self.workers {
            worker
                .sender()
                .send(ProxyMessage::Configure(Arc::clone(&builder)))
                .await
                .map_err(|_| RouterError::WorkerGone(worker.id()))?;
        }
        Ok(())
    }

    /// Counters summed over all workers.
    pub async fn stats(&self) -> Result<BTreeMap<&'static str, u64>, RouterError> {
        let mut totals = BTreeMap::new();
        for worker in &self.workers {
            let (tx, rx) = oneshot::channel();
            worker
                .sender()
                .send(ProxyMessage::Stats(tx))
                .await
                .map_err(|_| RouterError::WorkerGone(worker.id()))?;
            let snapshot = rx.await.map_err(|_| RouterError::WorkerGone(worker.id()))?;
            for (name, value) in snapshot {
                *totals.entry(name).or_insert(0) += value;
            }
        }
        Ok(totals)
    }

    /// Stop every worker and wait for its thread.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.shutdown();
        }
        info!("Router stopped");
    }
}

/// Sends requests to one worker.
#[derive(Debug, Clone)]
pub struct RouterClient {
    worker: usize,
    tx: mpsc::Sender<ProxyMessage>,
}

impl RouterClient {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Route `request` and wait for its reply. Waits for mailbox room
    /// rather than failing when the worker is backed up.
    pub async fn send(&self, request: Request, priority: Priority) -> Reply {
        let (tx, rx) = oneshot::channel();
        let msg = ProxyMessage::Request {
            request,
            priority,
            reply: tx,
        };
        if self.tx.send(msg).await.is_err() {
            return Reply::local_error("proxy worker is gone");
        }
        rx.await
            .unwrap_or_else(|_| Reply::local_error("proxy worker dropped the request"))
    }
}
