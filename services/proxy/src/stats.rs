//! Worker-local counters.
//!
//! Each worker owns one [`ProxyStats`]; nothing here is shared between
//! threads, so counters are plain cells.

use std::cell::Cell;

use mcroute_proto::Operation;

macro_rules! stats {
    ($($variant:ident => $name:literal,)*) => {
        /// A named counter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Stat {
            $($variant,)*
        }

        impl Stat {
            pub const ALL: &'static [Stat] = &[$(Stat::$variant,)*];

            /// Stable name, used in `stats` replies.
            pub fn name(self) -> &'static str {
                match self {
                    $(Stat::$variant => $name,)*
                }
            }
        }
    };
}

stats! {
    RequestsProcessing => "proxy_reqs_processing",
    RequestsWaiting => "proxy_reqs_waiting",
    RequestsSent => "proxy_request_num_outstanding_sent",
    BusyThrottled => "proxy_reqs_busy_throttled",
    BusyWaitTimeout => "proxy_reqs_busy_wait_timeout",
    LocalErrors => "proxy_reqs_local_error",

    CmdGet => "cmd_get_count",
    CmdUpdate => "cmd_update_count",
    CmdDelete => "cmd_delete_count",
    CmdArith => "cmd_arith_count",
    CmdTouch => "cmd_touch_count",
    CmdStats => "cmd_stats_count",
    CmdVersion => "cmd_version_count",
    CmdOther => "cmd_other_count",

    NumServers => "num_servers",
    NumServersNew => "num_servers_new",
    NumServersUp => "num_servers_up",
    NumServersDown => "num_servers_down",
    NumServersClosed => "num_servers_closed",

    DestinationPendingReqs => "destination_pending_reqs",
    DestinationMaxPendingReqs => "destination_max_pending_reqs",
    DestinationInflightReqs => "destination_inflight_reqs",
    DestinationMaxInflightReqs => "destination_max_inflight_reqs",
    DestinationBatchesSum => "destination_batches_sum",
    DestinationRequestsSum => "destination_requests_sum",

    ProbesSent => "probes_sent",

    RetransPerKbyteSum => "retrans_per_kbyte_sum",
    RetransPerKbyteMax => "retrans_per_kbyte_max",
    RetransNumTotal => "retrans_num_total",
    RetransClosedConnections => "retrans_closed_connections",

    InactiveConnectionsClosed => "inactive_connections_closed",

    ConfigSwaps => "config_swaps",
    ConfigLastSuccess => "config_last_success",
}

impl Stat {
    /// Per-command counter for `op`.
    pub fn for_operation(op: Operation) -> Stat {
        match op {
            Operation::Get | Operation::Gets | Operation::Metaget | Operation::LeaseGet => {
                Stat::CmdGet
            }
            Operation::Set
            | Operation::Add
            | Operation::Replace
            | Operation::Append
            | Operation::Prepend
            | Operation::Cas
            | Operation::LeaseSet => Stat::CmdUpdate,
            Operation::Delete => Stat::CmdDelete,
            Operation::Incr | Operation::Decr => Stat::CmdArith,
            Operation::Touch => Stat::CmdTouch,
            Operation::Stats => Stat::CmdStats,
            Operation::Version => Stat::CmdVersion,
            Operation::FlushAll => Stat::CmdOther,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Counter table for one worker.
#[derive(Debug)]
pub struct ProxyStats {
    values: Vec<Cell<u64>>,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            values: Stat::ALL.iter().map(|_| Cell::new(0)).collect(),
        }
    }

    pub fn increment(&self, stat: Stat) {
        self.increment_by(stat, 1);
    }

    pub fn increment_by(&self, stat: Stat, amount: u64) {
        let cell = &self.values[stat.index()];
        cell.set(cell.get().saturating_add(amount));
    }

    pub fn decrement(&self, stat: Stat) {
        let cell = &self.values[stat.index()];
        cell.set(cell.get().saturating_sub(1));
    }

    /// Apply a signed delta, saturating at zero.
    pub fn add(&self, stat: Stat, diff: i64) {
        let cell = &self.values[stat.index()];
        let value = if diff >= 0 {
            cell.get().saturating_add(diff.unsigned_abs())
        } else {
            cell.get().saturating_sub(diff.unsigned_abs())
        };
        cell.set(value);
    }

    pub fn set_value(&self, stat: Stat, value: u64) {
        self.values[stat.index()].set(value);
    }

    /// Raise `stat` to `value` if it is currently lower.
    pub fn set_max(&self, stat: Stat, value: u64) {
        let cell = &self.values[stat.index()];
        if value > cell.get() {
            cell.set(value);
        }
    }

    pub fn get_value(&self, stat: Stat) -> u64 {
        self.values[stat.index()].get()
    }

    /// All counters with their names, in declaration order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Stat::ALL
            .iter()
            .map(|stat| (stat.name(), self.get_value(*stat)))
            .collect()
    }

    /// `name value` lines for a `stats` reply.
    pub fn render(&self) -> String {
        self.snapshot()
            .into_iter()
            .map(|(name, value)| format!("{name} {value}\n"))
            .collect()
    }
}
