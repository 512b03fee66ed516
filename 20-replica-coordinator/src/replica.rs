//! Contacting a single replica.
//!
//! Each call to [`contact`] opens its own connection, sends one request and
//! waits for one reply. Replicas are treated as unreliable, independent peers,
//! so there is no pooling and no retry: every way the exchange can go wrong is
//! folded into a [`ReplicaOutcome`] instead of an error.

use std::{fmt, io, str::FromStr, time::Duration};

use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tracing::debug;

use crate::frame::{self, FrameError, Reply, Request};

/// Upper bound on a reply body accepted from a replica.
pub const MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

/// Host and port of one replica. A bare port means `localhost`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaAddress {
    host: String,
    port: u16,
}

impl ReplicaAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ReplicaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for ReplicaAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid replica address '{input}': {reason}")]
pub struct ParseAddressError {
    input: String,
    reason: &'static str,
}

impl FromStr for ReplicaAddress {
    type Err = ParseAddressError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let error = |reason| ParseAddressError {
            input: input.to_string(),
            reason,
        };
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(error("address is empty"));
        }

        if let Ok(port) = trimmed.parse::<u16>() {
            return Ok(Self::new("localhost", port));
        }

        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| error("expected host:port or a port number"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(error("host is empty"));
        }
        let port = port.parse().map_err(|_| error("port is not a number in 0-65535"))?;
        Ok(Self::new(host, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection could not be established or was reset.
    ConnectRefused,
    Timeout,
    MalformedResponse,
    /// The replica answered with a well-formed error reply.
    Declined,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::ConnectRefused => "connect-refused",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedResponse => "malformed-response",
            FailureKind::Declined => "declined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Success(Vec<u8>),
    Failure(FailureKind),
}

impl ReplicaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplicaOutcome::Success(_))
    }
}

/// Sends `request` to `address` and waits at most `limit` for the reply.
pub async fn contact(address: &ReplicaAddress, request: &Request, limit: Duration) -> ReplicaOutcome {
    let outcome = match timeout(limit, exchange(address, request)).await {
        Ok(outcome) => outcome,
        Err(_) => ReplicaOutcome::Failure(FailureKind::Timeout),
    };
    debug!(replica = %address, ?outcome, "replica contacted");
    outcome
}

async fn exchange(address: &ReplicaAddress, request: &Request) -> ReplicaOutcome {
    let mut stream = match TcpStream::connect((address.host(), address.port())).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(replica = %address, error = ?err, "replica connection failed");
            return ReplicaOutcome::Failure(FailureKind::ConnectRefused);
        }
    };

    if let Err(err) = frame::write_request(&mut stream, request).await {
        return ReplicaOutcome::Failure(classify(address, err));
    }

    let outcome = match frame::read_reply(&mut stream, MAX_REPLY_BYTES).await {
        Ok(Reply::Resolved(payload)) => ReplicaOutcome::Success(payload),
        Ok(reply) => {
            debug!(replica = %address, ?reply, "replica declined request");
            ReplicaOutcome::Failure(FailureKind::Declined)
        }
        Err(err) => ReplicaOutcome::Failure(classify(address, err)),
    };

    let _ = stream.shutdown().await;
    outcome
}

fn classify(address: &ReplicaAddress, err: FrameError) -> FailureKind {
    debug!(replica = %address, error = %err, "replica exchange failed");
    match err {
        FrameError::Io(err) if is_connectivity(&err) => FailureKind::ConnectRefused,
        _ => FailureKind::MalformedResponse,
    }
}

fn is_connectivity(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
