//! # mcroute-proto
//!
//! Value types shared by every layer of the mcroute proxy.
//!
//! ## Contents
//!
//! - [`AccessPoint`]: immutable identity of a backend (host, port, protocol,
//!   TLS and compression flags)
//! - [`Request`] / [`Reply`]: the opaque key-value request and its result
//! - [`ResultCode`]: reply outcome plus the failure classification used for
//!   health tracking and failover
//! - [`codec`]: newline-delimited JSON framing used by the bundled transport
//!   and listener
//!
//! Requests are immutable once built and cheap to clone (payloads are
//! [`bytes::Bytes`]).

mod access_point;
pub mod codec;
mod error;
mod message;

pub use access_point::{AccessPoint, Protocol};
pub use codec::Priority;
pub use error::ProtoError;
pub use message::{Operation, Reply, Request, ResultCode, MAX_KEY_LEN};
