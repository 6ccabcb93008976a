//! Error types for the proxy.
//!
//! Request-path failures never leave the worker as `Err`; they are turned
//! into a [`Reply`](mcroute_proto::Reply) carrying a [`ResultCode`]. The
//! types here cover transport plumbing, option validation and the router
//! lifecycle.

use std::io;
use std::time::Duration;

use mcroute_proto::{ProtoError, ResultCode};
use thiserror::Error;

/// Errors from establishing or using a backend connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend refused the connection or could not be resolved.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// No connection within the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Read or write failure on an established connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// The connection was closed locally while the request was outstanding.
    #[error("connection aborted")]
    Aborted,

    /// The backend sent something that could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtoError),

    /// The access point asks for something this transport cannot do.
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Result code reported to the caller for a request failed by this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            TransportError::ConnectFailed(_) => ResultCode::ConnectError,
            TransportError::ConnectTimeout(_) => ResultCode::ConnectTimeout,
            TransportError::Io(_) | TransportError::Closed | TransportError::Codec(_) => {
                ResultCode::RemoteError
            }
            TransportError::Aborted => ResultCode::Aborted,
            TransportError::Unsupported(_) => ResultCode::LocalError,
        }
    }

    /// Whether the connection can no longer be used after this error.
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, TransportError::Unsupported(_))
    }
}

/// Invalid router options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{0}")]
    Invalid(String),
}

/// Errors from the router and its worker threads.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to start worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },

    /// The target worker has stopped and no longer accepts messages.
    #[error("worker {0} is gone")]
    WorkerGone(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_errors_are_hard_failures() {
        let refused = TransportError::ConnectFailed(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.result_code().is_hard_tko_error());
        assert!(TransportError::ConnectTimeout(Duration::from_millis(5))
            .result_code()
            .is_hard_tko_error());
    }

    #[test]
    fn test_established_connection_errors_do_not_tko() {
        for err in [TransportError::Closed, TransportError::Aborted] {
            let code = err.result_code();
            assert!(code.is_error());
            assert!(!code.is_hard_tko_error());
            assert!(!code.is_soft_tko_error());
        }
        assert!(!TransportError::Unsupported("ssl").is_connection_failure());
    }
}
