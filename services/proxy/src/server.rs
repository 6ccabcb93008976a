//! TCP front end.
//!
//! Clients speak the newline-delimited JSON framing from
//! [`mcroute_proto::codec`]. Each connection is bound to one worker, and
//! replies are written as they complete, so they may come back out of order.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcroute_proto::codec::{self, ReplyFrame, RequestFrame, MAX_FRAME_LEN};
use mcroute_proto::Reply;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::framing::FrameReader;
use crate::router::{Router, RouterClient};

/// Default maximum concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Encoded replies buffered per connection before request tasks wait.
const REPLY_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections refused at the connection limit.
    pub connections_rejected: AtomicU64,
    pub requests_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    /// Connections closed for sending a frame over the size limit.
    pub oversized_frames: AtomicU64,
}

pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    router: Arc<Router>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, router: Arc<Router>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            router,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let client = self.router.client();
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_connection(stream, client, &stats).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    client: RouterClient,
    stats: &ListenerStats,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    debug!(worker = client.worker(), "Connection accepted");

    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(REPLY_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            write.write_all(&line).await?;
        }
        write.shutdown().await
    });

    let mut frames = FrameReader::new(read);
    loop {
        let line = match frames.next_frame().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                stats.oversized_frames.fetch_add(1, Ordering::Relaxed);
                warn!(limit = MAX_FRAME_LEN, "Frame too large, closing connection");
                break;
            }
            Err(e) => return Err(e),
        };
        if line.trim_ascii().is_empty() {
            continue;
        }

        let frame = match codec::decode_line::<RequestFrame>(line) {
            Ok(frame) => frame,
            Err(e) => {
                stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Malformed request frame");
                let reply = Reply::local_error(format!("malformed request: {e}"));
                send_frame(&tx, ReplyFrame { id: 0, reply }).await;
                continue;
            }
        };

        stats.requests_received.fetch_add(1, Ordering::Relaxed);
        let client = client.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = client.send(frame.request, frame.priority).await;
            send_frame(&tx, ReplyFrame { id: frame.id, reply }).await;
        });
    }

    // The writer finishes once every request task has replied.
    drop(tx);
    writer.await.map_err(io::Error::other)?
}

async fn send_frame(tx: &mpsc::Sender<Vec<u8>>, frame: ReplyFrame) {
    match codec::encode_line(&frame) {
        Ok(line) => {
            let _ = tx.send(line).await;
        }
        Err(e) => debug!(id = frame.id, error = %e, "Failed to encode reply"),
    }
}
