use std::{io::Write, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    cli::SendArgs,
    frame::{self, Reply, Request},
    replica::{MAX_REPLY_BYTES, ReplicaAddress},
};

/// Sends one request to a coordinator (or any server speaking the protocol)
/// and waits at most `limit` for its reply.
pub async fn send(address: &ReplicaAddress, request: &Request, limit: Duration) -> Result<Reply> {
    timeout(limit, exchange(address, request))
        .await
        .with_context(|| format!("no reply from {address} within {} ms", limit.as_millis()))?
}

async fn exchange(address: &ReplicaAddress, request: &Request) -> Result<Reply> {
    let mut stream = TcpStream::connect((address.host(), address.port()))
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    debug!("connected to {address}");

    frame::write_request(&mut stream, request)
        .await
        .context("failed to send request")?;
    let reply = frame::read_reply(&mut stream, MAX_REPLY_BYTES)
        .await
        .context("failed to read reply")?;

    let _ = stream.shutdown().await;
    Ok(reply)
}

/// Entry point of the `send` subcommand.
pub async fn run(args: SendArgs) -> Result<()> {
    let limit = Duration::from_millis(args.timeout_ms);
    let reply = send(&args.coordinator, &Request::new(args.payload), limit).await?;

    match reply {
        Reply::Resolved(payload) => {
            let mut stdout = std::io::stdout();
            stdout.write_all(&payload)?;
            stdout.write_all(b"\n")?;
            stdout.flush()?;
            Ok(())
        }
        Reply::Unresolved(unresolved) => {
            bail!("unresolved ({}): {}", unresolved.reason, unresolved.detail)
        }
        Reply::Rejected(message) => bail!("rejected: {message}"),
    }
}
