//! Test harness for proxy integration tests.
//!
//! Provides an in-process key/value backend speaking the JSON-line framing,
//! a proxy (router plus listener) bound to a loopback port, and a framed
//! client for talking to it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mcroute_proto::codec::{self, ReplyFrame, RequestFrame};
use mcroute_proto::{AccessPoint, Operation, Priority, Protocol, Reply, Request, ResultCode};
use mcroute_proxy::{pool_config, Listener, ListenerConfig, Router, RouterOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

type Store = Arc<Mutex<HashMap<String, Bytes>>>;

#[allow(dead_code)]
pub struct MemcacheBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub requests: Arc<AtomicU64>,
    /// While set, connections are dropped as soon as a request arrives.
    pub broken: Arc<AtomicBool>,
    store: Store,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl MemcacheBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on(TcpListener::bind("127.0.0.1:0").await?)
    }

    /// Serve on a specific port, e.g. one a test previously left dead.
    pub async fn spawn_at(port: u16) -> io::Result<Self> {
        Self::spawn_on(TcpListener::bind(("127.0.0.1", port)).await?)
    }

    fn spawn_on(listener: TcpListener) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let requests = Arc::new(AtomicU64::new(0));
        let broken = Arc::new(AtomicBool::new(false));
        let store: Store = Arc::new(Mutex::new(HashMap::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let req_clone = Arc::clone(&requests);
        let broken_clone = Arc::clone(&broken);
        let store_clone = Arc::clone(&store);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(serve(
                                    stream,
                                    Arc::clone(&store_clone),
                                    Arc::clone(&req_clone),
                                    Arc::clone(&broken_clone),
                                ));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            requests,
            broken,
            store,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn access_point(&self) -> AccessPoint {
        AccessPoint::new("127.0.0.1", self.addr.port(), Protocol::Caret, false, false)
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn stored(&self, key: &str) -> Option<Bytes> {
        self.store.lock().unwrap().get(key).cloned()
    }
}

impl Drop for MemcacheBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(stream: TcpStream, store: Store, requests: Arc<AtomicU64>, broken: Arc<AtomicBool>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if broken.load(Ordering::Relaxed) {
            return;
        }
        let Ok(frame) = codec::decode_line::<RequestFrame>(line.as_bytes()) else {
            return;
        };
        requests.fetch_add(1, Ordering::Relaxed);

        let reply = apply(&store, &frame.request);
        let Ok(out) = codec::encode_line(&ReplyFrame {
            id: frame.id,
            reply,
        }) else {
            return;
        };
        if write.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn apply(store: &Store, request: &Request) -> Reply {
    let mut store = store.lock().unwrap();
    match request.op {
        Operation::Get | Operation::Gets => match store.get(&request.key) {
            Some(value) => Reply::new(ResultCode::Found).with_value(value.clone()),
            None => Reply::new(ResultCode::NotFound),
        },
        Operation::Set => {
            let value = request.value.clone().unwrap_or_default();
            store.insert(request.key.clone(), value);
            Reply::new(ResultCode::Stored)
        }
        Operation::Delete => match store.remove(&request.key) {
            Some(_) => Reply::new(ResultCode::Deleted),
            None => Reply::new(ResultCode::NotFound),
        },
        Operation::Version => Reply::new(ResultCode::Ok).with_value("harness-1.0"),
        _ => Reply::new(ResultCode::RemoteError).with_message("unsupported"),
    }
}

/// A port nothing listens on.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[allow(dead_code)]
pub fn dead_access_point(port: u16) -> AccessPoint {
    AccessPoint::new("127.0.0.1", port, Protocol::Caret, false, false)
}

/// Options suited to tests: one worker, fast probes.
#[allow(dead_code)]
pub fn test_options() -> RouterOptions {
    let mut options = RouterOptions::default();
    options.probe.initial_delay = Duration::from_millis(30);
    options.probe.max_delay = Duration::from_millis(100);
    options.probe.jitter_min = 0.0;
    options.probe.jitter_max = 0.0;
    options
}

#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub router: Arc<Router>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(
        options: RouterOptions,
        servers: Vec<AccessPoint>,
        failover: bool,
    ) -> io::Result<Self> {
        let router = Arc::new(Router::new(options).map_err(io::Error::other)?);
        router
            .configure(pool_config(servers, Duration::from_millis(500), failover))
            .await
            .map_err(io::Error::other)?;

        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Listener::bind(config, Arc::clone(&router)).await?;
        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        tokio::spawn(async move {
            let _ = listener.run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            router,
        })
    }

    pub async fn client(&self) -> io::Result<FrameClient> {
        FrameClient::connect(self.listen_addr).await
    }
}

/// Speaks request frames to a listener.
#[allow(dead_code)]
pub struct FrameClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    next_id: u64,
}

#[allow(dead_code)]
impl FrameClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
            next_id: 1,
        })
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write.write_all(bytes).await
    }

    pub async fn read_frame(&mut self) -> io::Result<ReplyFrame> {
        let read = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply"))??;
        let line = read.ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        codec::decode_line(line.as_bytes()).map_err(io::Error::other)
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, request: Request) -> io::Result<Reply> {
        let id = self.next_id;
        self.next_id += 1;
        let line = codec::encode_line(&RequestFrame {
            id,
            priority: Priority::default(),
            request,
        })
        .map_err(io::Error::other)?;
        self.write.write_all(&line).await?;

        let frame = self.read_frame().await?;
        assert_eq!(frame.id, id, "replies arrive in order for sequential calls");
        Ok(frame.reply)
    }
}
