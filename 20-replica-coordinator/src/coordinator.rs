use std::{
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::CoordinatorConfig,
    dispatch::dispatch,
    frame::{self, FrameError, Reply, Request, RequestMetadata, UnresolvedReply},
    policy::{AggregateResult, UnresolvedReason},
};

const REJECT_LINGER: Duration = Duration::from_millis(250);

pub struct Coordinator {
    listener: TcpListener,
    config: Arc<CoordinatorConfig>,
}

impl Coordinator {
    pub fn new(listener: TcpListener, config: CoordinatorConfig) -> Self {
        Self {
            listener,
            config: Arc::new(config),
        }
    }

    /// Binds the configured listen address.
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Coordinator { listener, config } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("coordinator shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &config);
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

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    config: &Arc<CoordinatorConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, config: &Arc<CoordinatorConfig>) {
    let config = Arc::clone(config);
    tokio::spawn(async move {
        if let Err(err) = handle_session(stream, peer, &config).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

/// Runs one client connection: await the request, dispatch it, respond, close.
async fn handle_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &CoordinatorConfig,
) -> Result<()> {
    let Some(request) = await_request(&mut stream, peer, config).await? else {
        return Ok(());
    };

    let request = with_metadata(request);
    debug!(
        peer = %peer,
        bytes = request.payload.len(),
        request_id = request.metadata.as_ref().map(|meta| meta.request_id.as_str()),
        "dispatching request"
    );
    let result = dispatch(&request, config.replicas(), &config.dispatch).await;

    respond(&mut stream, peer, &reply_for(result), config.client_timeout).await;
    Ok(())
}

/// Reads the single request of a session. Bad input is answered with a
/// rejection before the session ends.
async fn await_request(
    stream: &mut TcpStream,
    peer: SocketAddr,
    config: &CoordinatorConfig,
) -> Result<Option<Request>> {
    let read = timeout(
        config.client_timeout,
        frame::read_request(stream, config.max_request_bytes),
    )
    .await;

    let rejection = match read {
        Ok(Ok(Some(request))) => return Ok(Some(request)),
        Ok(Ok(None)) => {
            debug!(peer = %peer, "client closed before sending a request");
            return Ok(None);
        }
        Ok(Err(FrameError::Io(err))) => {
            return Err(err).context("failed to read client request");
        }
        Ok(Err(err)) => err.to_string(),
        Err(_) => format!(
            "no request received within {} ms",
            config.client_timeout.as_millis()
        ),
    };

    warn!(peer = %peer, reason = %rejection, "rejecting client request");
    respond(stream, peer, &Reply::Rejected(rejection), config.client_timeout).await;
    discard_unread(stream).await;
    Ok(None)
}

/// Reads and drops whatever the client still sends, so closing the socket
/// with unread input does not reset the connection before the rejection is read.
async fn discard_unread(stream: &mut TcpStream) {
    let mut sink = tokio::io::sink();
    let _ = timeout(REJECT_LINGER, tokio::io::copy(stream, &mut sink)).await;
}

fn with_metadata(mut request: Request) -> Request {
    if request.metadata.is_none() {
        let issued_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        request.metadata = Some(RequestMetadata {
            request_id: nanoid::nanoid!(),
            issued_at_ms,
        });
    }
    request
}

pub fn reply_for(result: AggregateResult) -> Reply {
    match result {
        AggregateResult::Resolved(payload) => Reply::Resolved(payload),
        AggregateResult::Unresolved(reason) => Reply::Unresolved(UnresolvedReply {
            reason,
            detail: match reason {
                UnresolvedReason::AllFailed => "every replica failed".to_string(),
                UnresolvedReason::NoQuorum => "replicas did not reach agreement".to_string(),
            },
        }),
    }
}

/// Writes the reply and closes the write half. A client that stops reading
/// gets at most `limit` before the session gives up on it.
async fn respond(stream: &mut TcpStream, peer: SocketAddr, reply: &Reply, limit: Duration) {
    match timeout(limit, frame::write_reply(stream, reply)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(peer = %peer, error = %err, "failed to write reply");
            return;
        }
        Err(_) => {
            warn!(
                peer = %peer,
                limit_ms = limit.as_millis() as u64,
                "client did not read the reply in time"
            );
            return;
        }
    }
    if let Err(err) = stream.shutdown().await {
        debug!(peer = %peer, error = ?err, "failed to shut down client stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_metadata_is_forwarded_unchanged() {
        let metadata = RequestMetadata {
            request_id: "outer".into(),
            issued_at_ms: 42,
        };
        let request = Request {
            metadata: Some(metadata.clone()),
            payload: b"p".to_vec(),
        };
        assert_eq!(with_metadata(request).metadata, Some(metadata));
    }

    #[test]
    fn missing_metadata_is_attached() {
        let request = with_metadata(Request::new("p"));
        let metadata = request.metadata.expect("metadata attached");
        assert!(!metadata.request_id.is_empty());
        assert!(metadata.issued_at_ms > 0);
    }

    #[tokio::test]
    async fn respond_gives_up_on_a_client_that_never_reads() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let idle_client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut stream, peer) = listener.accept().await.unwrap();

        // Far more than the socket buffers hold, so the write blocks.
        let reply = Reply::Resolved(vec![b'x'; 64 * 1024 * 1024]);
        let finished = timeout(
            Duration::from_secs(5),
            respond(&mut stream, peer, &reply, Duration::from_millis(100)),
        )
        .await;

        assert!(finished.is_ok(), "respond kept waiting for the client");
        drop(idle_client);
    }

    #[test]
    fn unresolved_results_keep_their_reason() {
        let reply = reply_for(AggregateResult::Unresolved(UnresolvedReason::NoQuorum));
        assert!(matches!(
            reply,
            Reply::Unresolved(UnresolvedReply {
                reason: UnresolvedReason::NoQuorum,
                ..
            })
        ));
        assert_eq!(
            reply_for(AggregateResult::Resolved(b"ok".to_vec())),
            Reply::Resolved(b"ok".to_vec())
        );
    }
}
