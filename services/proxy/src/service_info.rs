//! Introspection answered by the worker itself.
//!
//! A get for `__mcroute__.<command>` never reaches a backend.

use std::fmt::Write;

use mcroute_proto::{Reply, ResultCode};

use crate::proxy::Proxy;

pub const SERVICE_INFO_PREFIX: &str = "__mcroute__.";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub(crate) fn handle(proxy: &Proxy, command: &str) -> Reply {
    let body = match command {
        "version" => version().to_string(),
        "proxy_id" => proxy.id().to_string(),
        "requests_processing" => proxy.num_processing().to_string(),
        "requests_waiting" => proxy.num_waiting().to_string(),
        "config" => proxy.config().root().describe(),
        "options" => match serde_json::to_string(proxy.context().options()) {
            Ok(json) => json,
            Err(e) => return Reply::local_error(format!("cannot encode options: {e}")),
        },
        "destinations" => destinations(proxy),
        _ => {
            return Reply::local_error(format!("unknown service info command: {command}"));
        }
    };
    Reply::new(ResultCode::Found).with_value(body)
}

/// One `key state tko|ok pending inflight` line per live destination.
fn destinations(proxy: &Proxy) -> String {
    let mut out = String::new();
    for destination in proxy.destination_map().destinations() {
        let _ = writeln!(
            out,
            "{} {} {} {} {}",
            destination.key(),
            destination.state(),
            if destination.may_send() { "ok" } else { "tko" },
            destination.pending_request_count(),
            destination.inflight_request_count(),
        );
    }
    out
}
