//! mcroute proxy core
//!
//! Routes memcache requests to backend servers. The pieces, bottom up:
//! - [`AsyncEndpointClient`]: one lazily connected, multiplexed connection
//!   to a single backend
//! - [`ProxyDestination`]: a backend as seen by one worker, with health
//!   tracking and probing
//! - [`ProxyDestinationMap`]: deduplicates destinations and closes idle ones
//! - [`Proxy`]: per-worker admission control and priority queues
//! - [`Router`]: the worker threads plus the TKO state they share
//! - [`Listener`]: the TCP front end

pub mod client;
pub mod config;
pub mod context;
pub mod destination;
pub mod destination_map;
pub mod error;
mod framing;
pub mod proxy;
pub mod route;
pub mod router;
pub mod server;
pub mod service_info;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::{
    AsyncEndpointClient, ClientObserver, ClientOptions, Connection, ConnectionState, TcpTransport,
    Transport,
};
pub use config::{Config, ProbeOptions, RouterOptions, RxmitOptions};
pub use context::WorkerContext;
pub use destination::{DestinationState, ProxyDestination};
pub use destination_map::{destination_key, ProxyDestinationMap};
pub use error::{ConfigError, RouterError, TransportError};
pub use proxy::{Proxy, ReplyFn, RequestContext};
pub use route::{
    pool_config, ConfigBuilder, DestinationRoute, ErrorRoute, FailoverRoute, HashRoute,
    ProxyConfig, RouteHandle, RouteHandlePtr,
};
pub use router::{Router, RouterClient};
pub use server::{Listener, ListenerConfig, ListenerStats};
pub use stats::{ProxyStats, Stat};

pub use mcroute_proto::Priority;
