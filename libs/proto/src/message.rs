//! Requests, replies and result codes.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Longest key a backend accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Operation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Gets,
    Metaget,
    LeaseGet,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    LeaseSet,
    Delete,
    Incr,
    Decr,
    Touch,
    FlushAll,
    Stats,
    Version,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Gets => "gets",
            Operation::Metaget => "metaget",
            Operation::LeaseGet => "lease-get",
            Operation::Set => "set",
            Operation::Add => "add",
            Operation::Replace => "replace",
            Operation::Append => "append",
            Operation::Prepend => "prepend",
            Operation::Cas => "cas",
            Operation::LeaseSet => "lease-set",
            Operation::Delete => "delete",
            Operation::Incr => "incr",
            Operation::Decr => "decr",
            Operation::Touch => "touch",
            Operation::FlushAll => "flush_all",
            Operation::Stats => "stats",
            Operation::Version => "version",
        }
    }

    /// Operations answered by the proxy itself and never rate limited.
    pub fn is_rate_limit_exempt(self) -> bool {
        matches!(self, Operation::Stats | Operation::Version)
    }

    /// Operations whose key must be a valid backend key.
    pub fn has_key(self) -> bool {
        !matches!(
            self,
            Operation::Stats | Operation::Version | Operation::FlushAll
        )
    }

    pub fn is_get_like(self) -> bool {
        matches!(
            self,
            Operation::Get | Operation::Gets | Operation::Metaget | Operation::LeaseGet
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An inbound key-value request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub op: Operation,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Bytes>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub exptime: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<u64>,
}

impl Request {
    pub fn new(op: Operation, key: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            value: None,
            flags: 0,
            exptime: 0,
            cas: None,
            delta: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Operation::Get, key)
    }

    pub fn set(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(Operation::Set, key).with_value(value)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Operation::Delete, key)
    }

    pub fn version() -> Self {
        Self::new(Operation::Version, "")
    }

    /// `stats` request; `args` selects a stats group (empty for all).
    pub fn stats(args: impl Into<String>) -> Self {
        Self::new(Operation::Stats, args)
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }

    /// Check that the key can be put on the wire.
    pub fn validate_key(&self) -> Result<(), ProtoError> {
        if !self.op.has_key() {
            return Ok(());
        }
        if self.key.is_empty() {
            return Err(ProtoError::BadKey { reason: "empty key" });
        }
        if self.key.len() > MAX_KEY_LEN {
            return Err(ProtoError::BadKey {
                reason: "key exceeds 250 bytes",
            });
        }
        if self
            .key
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(ProtoError::BadKey {
                reason: "key contains whitespace or control characters",
            });
        }
        Ok(())
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Found,
    NotFound,
    Stored,
    NotStored,
    Exists,
    Deleted,
    Touched,
    /// The proxy or backend refused the request for lack of capacity.
    Busy,
    /// The request was sent but no reply arrived in time.
    Timeout,
    ConnectError,
    ConnectTimeout,
    /// The backend replied with a server-side error.
    RemoteError,
    /// The proxy failed the request without talking to the backend.
    LocalError,
    /// The destination is marked TKO and was skipped.
    Tko,
    BadKey,
    TryAgain,
    /// The backend is shutting down.
    Shutdown,
    /// The request was cancelled because its connection was closed locally.
    Aborted,
}

impl ResultCode {
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::Found => "found",
            ResultCode::NotFound => "notfound",
            ResultCode::Stored => "stored",
            ResultCode::NotStored => "notstored",
            ResultCode::Exists => "exists",
            ResultCode::Deleted => "deleted",
            ResultCode::Touched => "touched",
            ResultCode::Busy => "busy",
            ResultCode::Timeout => "timeout",
            ResultCode::ConnectError => "connect_error",
            ResultCode::ConnectTimeout => "connect_timeout",
            ResultCode::RemoteError => "remote_error",
            ResultCode::LocalError => "local_error",
            ResultCode::Tko => "tko",
            ResultCode::BadKey => "bad_key",
            ResultCode::TryAgain => "try_again",
            ResultCode::Shutdown => "shutdown",
            ResultCode::Aborted => "aborted",
        }
    }

    /// Any failure, as opposed to a definitive answer from the backend.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResultCode::Busy
                | ResultCode::Timeout
                | ResultCode::ConnectError
                | ResultCode::ConnectTimeout
                | ResultCode::RemoteError
                | ResultCode::LocalError
                | ResultCode::Tko
                | ResultCode::BadKey
                | ResultCode::TryAgain
                | ResultCode::Shutdown
                | ResultCode::Aborted
        )
    }

    /// Failures that signal the backend is unreachable.
    pub fn is_hard_tko_error(self) -> bool {
        matches!(
            self,
            ResultCode::ConnectError | ResultCode::ConnectTimeout | ResultCode::Shutdown
        )
    }

    /// Failures that signal the backend is slow.
    pub fn is_soft_tko_error(self) -> bool {
        matches!(self, ResultCode::Timeout)
    }

    /// Failures after which a failover route should try another destination.
    pub fn is_failover_error(self) -> bool {
        matches!(
            self,
            ResultCode::Busy
                | ResultCode::Timeout
                | ResultCode::ConnectError
                | ResultCode::ConnectTimeout
                | ResultCode::RemoteError
                | ResultCode::Tko
                | ResultCode::TryAgain
                | ResultCode::Shutdown
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub result: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Bytes>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Access point of the destination that produced the reply, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl Reply {
    pub fn new(result: ResultCode) -> Self {
        Self {
            result,
            value: None,
            flags: 0,
            message: None,
            destination: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn busy() -> Self {
        Self::new(ResultCode::Busy)
    }

    pub fn local_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::LocalError).with_message(message)
    }

    pub fn is_error(&self) -> bool {
        self.result.is_error()
    }
}
