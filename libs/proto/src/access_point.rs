//! Backend access points.
//!
//! Access point strings have the form
//! `host:port[:protocol[:ssl|plain[:compressed|notcompressed]]]`. IPv6 hosts
//! are written in brackets (`[::1]:11211:caret`). Missing trailing parts
//! fall back to caller-supplied defaults.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Wire protocol spoken to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Line-oriented text protocol. Replies arrive strictly in request order,
    /// so a connection cannot carry requests with different timeouts.
    Ascii,
    /// Binary protocol with request ids.
    Caret,
    /// Legacy binary protocol with request ids.
    Umbrella,
}

impl Protocol {
    /// Whether replies may arrive out of order (requests are tagged with ids).
    pub fn is_multiplexing(self) -> bool {
        !matches!(self, Protocol::Ascii)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ascii => "ascii",
            Protocol::Caret => "caret",
            Protocol::Umbrella => "umbrella",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascii" => Ok(Protocol::Ascii),
            "caret" => Ok(Protocol::Caret),
            "umbrella" => Ok(Protocol::Umbrella),
            other => Err(ProtoError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Immutable identity of one backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessPoint {
    host: String,
    port: u16,
    protocol: Protocol,
    use_ssl: bool,
    compressed: bool,
    is_v6: bool,
}

impl AccessPoint {
    /// Create an access point. IP hosts are normalized; anything else is kept
    /// verbatim as a hostname.
    pub fn new(host: &str, port: u16, protocol: Protocol, use_ssl: bool, compressed: bool) -> Self {
        let (host, is_v6) = match host.parse::<IpAddr>() {
            Ok(ip) => (ip.to_string(), ip.is_ipv6()),
            Err(_) => (host.to_string(), false),
        };

        Self {
            host,
            port,
            protocol,
            use_ssl,
            compressed,
            is_v6,
        }
    }

    /// Parse an access point string, using `default_protocol` when the string
    /// does not name one. TLS and compression default to off.
    pub fn parse(input: &str, default_protocol: Protocol) -> Result<Self, ProtoError> {
        let invalid = |reason| ProtoError::InvalidAccessPoint {
            input: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(invalid("empty"));
        }

        let (host, rest) = if let Some(stripped) = input.strip_prefix('[') {
            let closing = stripped.find(']').ok_or_else(|| invalid("unterminated IPv6 host"))?;
            (&stripped[..closing], &stripped[closing + 1..])
        } else {
            match input.find(':') {
                Some(colon) => (&input[..colon], &input[colon..]),
                None => (input, ""),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let parts: Vec<&str> = match rest {
            "" => Vec::new(),
            r => {
                let Some(r) = r.strip_prefix(':') else {
                    return Err(invalid("expected ':' after host"));
                };
                r.split(':').collect()
            }
        };

        if parts.len() > 4 {
            return Err(invalid("too many parts"));
        }

        let port = parts
            .first()
            .ok_or_else(|| invalid("missing port"))?
            .parse::<u16>()
            .map_err(|_| invalid("invalid port"))?;

        let protocol = match parts.get(1) {
            Some(p) => p.parse()?,
            None => default_protocol,
        };

        let use_ssl = match parts.get(2).copied() {
            None | Some("plain") => false,
            Some("ssl") => true,
            Some(_) => return Err(invalid("invalid encryption")),
        };

        let compressed = match parts.get(3).copied() {
            None | Some("notcompressed") => false,
            Some("compressed") => true,
            Some(_) => return Err(invalid("invalid compression")),
        };

        Ok(Self::new(host, port, protocol, use_ssl, compressed))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_v6(&self) -> bool {
        self.is_v6
    }

    /// `host:port`, with IPv6 hosts bracketed. Suitable for `TcpStream::connect`.
    pub fn host_port(&self) -> String {
        if self.is_v6 {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for AccessPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.host_port(),
            self.protocol,
            if self.use_ssl { "ssl" } else { "plain" },
            if self.compressed { "compressed" } else { "notcompressed" }
        )
    }
}
