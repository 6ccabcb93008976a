//! Newline-delimited JSON framing.
//!
//! Every frame is a single JSON object terminated by `\n`. Clients send
//! [`RequestFrame`]s and receive [`ReplyFrame`]s carrying the same `id`; ids
//! let replies arrive out of order on multiplexing connections.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::message::{Reply, Request};

/// Upper bound on a single encoded frame, newline included.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Scheduling class of an inbound request. Lower index drains first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Critical,
    Async,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 2] = [Priority::Critical, Priority::Async];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Async => "async",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(default)]
    pub priority: Priority,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub reply: Reply,
}

/// Encode a frame as one JSON line, trailing newline included.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtoError> {
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line. Surrounding whitespace (including the newline) is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, ProtoError> {
    Ok(serde_json::from_slice(line.trim_ascii())?)
}
