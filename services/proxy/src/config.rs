//! Proxy configuration.
//!
//! [`RouterOptions`] holds every tunable of the routing core and is shared
//! read-only by all workers. [`Config`] is the binary's env-driven
//! configuration wrapping it.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use mcroute_proto::{AccessPoint, Protocol};
use serde::Serialize;

use crate::error::ConfigError;

/// Probe scheduling for TKO destinations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOptions {
    /// Delay before the first probe after a destination is marked TKO.
    pub initial_delay: Duration,
    /// Upper bound on the un-jittered probe delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every probe.
    pub backoff_factor: f64,
    /// Each delay is stretched by a random fraction in `[jitter_min, jitter_max]`.
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.5,
            jitter_min: 0.05,
            jitter_max: 0.5,
        }
    }
}

/// Lossy-connection heuristic based on TCP retransmit rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RxmitOptions {
    /// How often to sample a connection's retransmit rate. `None` disables
    /// the heuristic.
    pub collect_every: Option<Duration>,
    /// Starting (and lowest) retransmits-per-KB threshold. Zero never closes.
    pub min_reconnect_threshold: u64,
    /// Highest threshold. Zero means unbounded.
    pub max_reconnect_threshold: u64,
    /// Forced reconnects are held off by `collect_every` times a random
    /// factor in `1..=holdoff_factor`.
    pub holdoff_factor: u32,
}

impl Default for RxmitOptions {
    fn default() -> Self {
        Self {
            collect_every: None,
            min_reconnect_threshold: 0,
            max_reconnect_threshold: 0,
            holdoff_factor: 25,
        }
    }
}

/// Options for the routing core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterOptions {
    /// Number of worker threads.
    pub num_proxies: usize,

    /// Requests a worker processes concurrently before queuing. Zero disables
    /// admission control entirely.
    pub proxy_max_inflight_requests: usize,

    /// Cap on queued requests per worker; requests past it get a busy reply.
    /// `None` leaves the queue unbounded.
    pub proxy_max_throttled_requests: Option<usize>,

    /// Queued requests older than this are answered busy instead of routed.
    pub waiting_request_timeout: Option<Duration>,

    /// Consecutive failures before a destination is marked TKO.
    pub failures_until_tko: usize,

    /// Fleet-wide cap on concurrent soft TKOs.
    pub maximum_soft_tkos: usize,

    pub disable_tko_tracking: bool,

    pub probe: ProbeOptions,

    /// Idle connections are closed after one to two of these intervals.
    /// `None` keeps them open forever.
    pub reset_inactive_connection_interval: Option<Duration>,

    /// Per-connection limit on requests written but not yet answered. Zero
    /// is unlimited.
    pub target_max_inflight_requests: usize,

    /// Per-connection limit on requests waiting to be written. Zero is
    /// unlimited.
    pub target_max_pending_requests: usize,

    pub rxmit: RxmitOptions,

    /// Capacity of each worker's mailbox.
    pub client_queue_size: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            num_proxies: 1,
            proxy_max_inflight_requests: 0,
            proxy_max_throttled_requests: None,
            waiting_request_timeout: None,
            failures_until_tko: 3,
            maximum_soft_tkos: 40,
            disable_tko_tracking: false,
            probe: ProbeOptions::default(),
            reset_inactive_connection_interval: Some(Duration::from_secs(60)),
            target_max_inflight_requests: 0,
            target_max_pending_requests: 100_000,
            rxmit: RxmitOptions::default(),
            client_queue_size: 1024,
        }
    }
}

impl RouterOptions {
    /// Check option combinations that would make the core misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_proxies == 0 {
            return Err(ConfigError::Zero { field: "num_proxies" });
        }
        if self.failures_until_tko == 0 {
            return Err(ConfigError::Zero {
                field: "failures_until_tko",
            });
        }
        if self.client_queue_size == 0 {
            return Err(ConfigError::Zero {
                field: "client_queue_size",
            });
        }
        if self.probe.initial_delay.is_zero() {
            return Err(ConfigError::Zero {
                field: "probe.initial_delay",
            });
        }
        if self.probe.max_delay < self.probe.initial_delay {
            return Err(ConfigError::Invalid(format!(
                "probe.max_delay ({:?}) is shorter than probe.initial_delay ({:?})",
                self.probe.max_delay, self.probe.initial_delay
            )));
        }
        if self.probe.backoff_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "probe.backoff_factor must be greater than 1.0, got {}",
                self.probe.backoff_factor
            )));
        }
        if self.probe.jitter_min < 0.0 || self.probe.jitter_max < self.probe.jitter_min {
            return Err(ConfigError::Invalid(format!(
                "probe jitter band [{}, {}] is invalid",
                self.probe.jitter_min, self.probe.jitter_max
            )));
        }
        if matches!(self.reset_inactive_connection_interval, Some(i) if i.is_zero()) {
            return Err(ConfigError::Zero {
                field: "reset_inactive_connection_interval",
            });
        }
        if matches!(self.rxmit.collect_every, Some(i) if i.is_zero()) {
            return Err(ConfigError::Zero {
                field: "rxmit.collect_every",
            });
        }
        if self.rxmit.max_reconnect_threshold != 0
            && self.rxmit.max_reconnect_threshold < self.rxmit.min_reconnect_threshold
        {
            return Err(ConfigError::Invalid(
                "rxmit.max_reconnect_threshold is below rxmit.min_reconnect_threshold".into(),
            ));
        }
        if self.rxmit.holdoff_factor == 0 {
            return Err(ConfigError::Zero {
                field: "rxmit.holdoff_factor",
            });
        }
        Ok(())
    }
}

/// Binary configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the client listener binds to.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Backend pool requests are hashed across.
    pub servers: Vec<AccessPoint>,

    /// Per-request timeout towards backends.
    pub server_timeout: Duration,

    /// Try the next server when the hashed one fails.
    pub failover: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub router: RouterOptions,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = lookup("MCROUTE_LISTEN_ADDR")
            .unwrap_or_else(|| "[::]:5000".to_string())
            .parse()
            .context("MCROUTE_LISTEN_ADDR must be a socket address (example: 0.0.0.0:5000).")?;

        let max_connections =
            parse_var(&lookup, "MCROUTE_MAX_CONNECTIONS", "an integer")?.unwrap_or(10_000);

        let protocol: Protocol = lookup("MCROUTE_SERVER_PROTOCOL")
            .map(|v| v.parse())
            .transpose()
            .context("MCROUTE_SERVER_PROTOCOL must be one of ascii, caret, umbrella.")?
            .unwrap_or(Protocol::Ascii);

        let servers = lookup("MCROUTE_SERVERS")
            .context("Missing backend list. Set MCROUTE_SERVERS (example: 10.0.0.1:11211,10.0.0.2:11211).")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                AccessPoint::parse(s, protocol)
                    .with_context(|| format!("MCROUTE_SERVERS entry '{s}' is not a valid access point."))
            })
            .collect::<Result<Vec<_>>>()?;
        anyhow::ensure!(!servers.is_empty(), "MCROUTE_SERVERS must list at least one server.");

        let server_timeout = Duration::from_millis(
            parse_var(&lookup, "MCROUTE_SERVER_TIMEOUT_MS", "an integer (milliseconds)")?
                .unwrap_or(1000),
        );

        let failover = parse_bool(&lookup, "MCROUTE_FAILOVER").unwrap_or(true);

        let log_level = lookup("MCROUTE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let router = router_options(&lookup)?;
        router.validate().context("Invalid router options.")?;

        Ok(Self {
            listen_addr,
            max_connections,
            servers,
            server_timeout,
            failover,
            log_level,
            router,
        })
    }
}

fn router_options(lookup: &impl Fn(&str) -> Option<String>) -> Result<RouterOptions> {
    let defaults = RouterOptions::default();
    let ms = "an integer (milliseconds)";

    let probe = ProbeOptions {
        initial_delay: parse_ms(lookup, "MCROUTE_PROBE_DELAY_INITIAL_MS")?
            .unwrap_or(defaults.probe.initial_delay),
        max_delay: parse_ms(lookup, "MCROUTE_PROBE_DELAY_MAX_MS")?
            .unwrap_or(defaults.probe.max_delay),
        ..defaults.probe.clone()
    };

    let rxmit = RxmitOptions {
        collect_every: parse_ms(lookup, "MCROUTE_COLLECT_RXMIT_STATS_EVERY_MS")?
            .filter(|d| !d.is_zero()),
        min_reconnect_threshold: parse_var(lookup, "MCROUTE_MIN_RXMIT_RECONNECT_THRESHOLD", "an integer")?
            .unwrap_or(defaults.rxmit.min_reconnect_threshold),
        max_reconnect_threshold: parse_var(lookup, "MCROUTE_MAX_RXMIT_RECONNECT_THRESHOLD", "an integer")?
            .unwrap_or(defaults.rxmit.max_reconnect_threshold),
        ..defaults.rxmit.clone()
    };

    // Zero keeps the upstream meaning of "disabled" for these two.
    let waiting_request_timeout: Option<u64> =
        parse_var(lookup, "MCROUTE_WAITING_REQUEST_TIMEOUT_MS", ms)?;
    let reset_interval: Option<u64> =
        parse_var(lookup, "MCROUTE_RESET_INACTIVE_CONNECTION_INTERVAL_MS", ms)?;

    Ok(RouterOptions {
        num_proxies: parse_var(lookup, "MCROUTE_NUM_PROXIES", "an integer")?
            .unwrap_or(defaults.num_proxies),
        proxy_max_inflight_requests: parse_var(lookup, "MCROUTE_MAX_INFLIGHT_REQUESTS", "an integer")?
            .unwrap_or(defaults.proxy_max_inflight_requests),
        proxy_max_throttled_requests: parse_var(lookup, "MCROUTE_MAX_THROTTLED_REQUESTS", "an integer")?,
        waiting_request_timeout: waiting_request_timeout
            .filter(|v| *v > 0)
            .map(Duration::from_millis),
        failures_until_tko: parse_var(lookup, "MCROUTE_FAILURES_UNTIL_TKO", "an integer")?
            .unwrap_or(defaults.failures_until_tko),
        maximum_soft_tkos: parse_var(lookup, "MCROUTE_MAXIMUM_SOFT_TKOS", "an integer")?
            .unwrap_or(defaults.maximum_soft_tkos),
        disable_tko_tracking: parse_bool(lookup, "MCROUTE_DISABLE_TKO_TRACKING")
            .unwrap_or(defaults.disable_tko_tracking),
        probe,
        reset_inactive_connection_interval: match reset_interval {
            Some(0) => None,
            Some(v) => Some(Duration::from_millis(v)),
            None => defaults.reset_inactive_connection_interval,
        },
        target_max_inflight_requests: parse_var(lookup, "MCROUTE_TARGET_MAX_INFLIGHT_REQUESTS", "an integer")?
            .unwrap_or(defaults.target_max_inflight_requests),
        target_max_pending_requests: parse_var(lookup, "MCROUTE_TARGET_MAX_PENDING_REQUESTS", "an integer")?
            .unwrap_or(defaults.target_max_pending_requests),
        rxmit,
        client_queue_size: parse_var(lookup, "MCROUTE_CLIENT_QUEUE_SIZE", "an integer")?
            .unwrap_or(defaults.client_queue_size),
    })
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, what: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {what}."))
}

fn parse_ms(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(lookup, name, "an integer (milliseconds)")?.map(Duration::from_millis))
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    lookup(name).map(|v| v == "1" || v.to_lowercase() == "true")
}
