//! A small replica for demos and tests.
//!
//! It answers every request with a fixed reply, or echoes the payload when no
//! reply is configured, after an optional delay. Real replicas only need to
//! speak the same framing; nothing in the coordinator depends on this server.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ReplicaArgs,
    frame::{self, Reply},
};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ReplicaBehavior {
    /// Fixed reply payload; `None` echoes the request payload.
    pub reply: Option<Vec<u8>>,
    pub delay: Duration,
    /// Upper bound of a random extra delay.
    pub jitter: Duration,
}

impl ReplicaBehavior {
    pub fn replying(reply: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn echo() -> Self {
        Self::default()
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn pause(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        self.delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl From<&ReplicaArgs> for ReplicaBehavior {
    fn from(args: &ReplicaArgs) -> Self {
        Self {
            reply: args.reply.clone().map(String::into_bytes),
            delay: Duration::from_millis(args.delay_ms),
            jitter: Duration::from_millis(args.jitter_ms),
        }
    }
}

pub struct ReplicaServer {
    listener: TcpListener,
    behavior: Arc<ReplicaBehavior>,
}

impl ReplicaServer {
    pub fn new(listener: TcpListener, behavior: ReplicaBehavior) -> Self {
        Self {
            listener,
            behavior: Arc::new(behavior),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ReplicaServer { listener, behavior } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        let behavior = Arc::clone(&behavior);
                        tokio::spawn(async move {
                            if let Err(err) = serve(stream, &behavior).await {
                                debug!(peer = %peer, error = ?err, "replica connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn serve(mut stream: TcpStream, behavior: &ReplicaBehavior) -> Result<()> {
    let Some(request) = frame::read_request(&mut stream, MAX_REQUEST_BYTES).await? else {
        return Ok(());
    };

    sleep(behavior.pause()).await;

    let payload = behavior.reply.clone().unwrap_or(request.payload);
    frame::write_reply(&mut stream, &Reply::Resolved(payload)).await?;
    stream.shutdown().await.context("failed to close replica stream")?;
    Ok(())
}

/// Entry point of the `replica` subcommand.
pub async fn run(args: ReplicaArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = ReplicaServer::new(listener, ReplicaBehavior::from(&args));
    info!("replica listening on {}", server.local_addr()?);
    server.run_until_ctrl_c().await
}
