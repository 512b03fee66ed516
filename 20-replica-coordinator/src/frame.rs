//! Length-prefixed wire protocol shared by clients, coordinators and replicas.
//!
//! Every message is one frame: a big-endian `u32` body length followed by the
//! body. Requests and replies have their own body layouts on top of that, see
//! [`Request`] and [`Reply`]. Because both sides speak the same protocol, a
//! coordinator can be listed as another coordinator's replica.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::policy::UnresolvedReason;

const LEN_PREFIX: usize = 4;
const META_PREFIX: usize = 2;

const TAG_RESOLVED: u8 = 0x00;
const TAG_UNRESOLVED: u8 = 0x01;
const TAG_REJECTED: u8 = 0x02;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Per-request data the coordinator forwards identically to every replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMetadata {
    pub request_id: String,
    pub issued_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub metadata: Option<RequestMetadata>,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            metadata: None,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let meta = match &self.metadata {
            Some(metadata) => serde_json::to_vec(metadata).map_err(malformed)?,
            None => Vec::new(),
        };
        let meta_len = u16::try_from(meta.len())
            .map_err(|_| FrameError::Malformed("metadata too long".to_string()))?;

        let mut body = Vec::with_capacity(META_PREFIX + meta.len() + self.payload.len());
        body.extend_from_slice(&meta_len.to_be_bytes());
        body.extend_from_slice(&meta);
        body.extend_from_slice(&self.payload);
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < META_PREFIX {
            return Err(FrameError::Malformed("request shorter than its header".to_string()));
        }
        let meta_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let rest = &body[META_PREFIX..];
        if rest.len() < meta_len {
            return Err(FrameError::Malformed(format!(
                "metadata length {meta_len} exceeds body of {} bytes",
                rest.len()
            )));
        }

        let (meta, payload) = rest.split_at(meta_len);
        let metadata = if meta.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(meta).map_err(malformed)?)
        };

        Ok(Self {
            metadata,
            payload: payload.to_vec(),
        })
    }
}

/// Body of an unresolved reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedReply {
    pub reason: UnresolvedReason,
    pub detail: String,
}

/// What a coordinator (or replica) sends back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Resolved(Vec<u8>),
    Unresolved(UnresolvedReply),
    Rejected(String),
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut body = Vec::new();
        match self {
            Reply::Resolved(payload) => {
                body.push(TAG_RESOLVED);
                body.extend_from_slice(payload);
            }
            Reply::Unresolved(unresolved) => {
                body.push(TAG_UNRESOLVED);
                body.extend(serde_json::to_vec(unresolved).map_err(malformed)?);
            }
            Reply::Rejected(message) => {
                body.push(TAG_REJECTED);
                body.extend_from_slice(message.as_bytes());
            }
        }
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let Some((&tag, rest)) = body.split_first() else {
            return Err(FrameError::Malformed("empty reply".to_string()));
        };
        match tag {
            TAG_RESOLVED => Ok(Reply::Resolved(rest.to_vec())),
            TAG_UNRESOLVED => Ok(Reply::Unresolved(
                serde_json::from_slice(rest).map_err(malformed)?,
            )),
            TAG_REJECTED => Ok(Reply::Rejected(String::from_utf8_lossy(rest).into_owned())),
            other => Err(FrameError::Malformed(format!("unknown reply tag {other:#04x}"))),
        }
    }
}

/// Reads one frame body. Returns `Ok(None)` when the peer closed the stream
/// before sending any byte of a new frame.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let read = reader.read(&mut len_buf[filled..]).await?;
        if read == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += read;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(err)
        }
    })?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| FrameError::Malformed("frame body exceeds u32::MAX".to_string()))?;
    let mut encoded = Vec::with_capacity(LEN_PREFIX + body.len());
    encoded.extend_from_slice(&len.to_be_bytes());
    encoded.extend_from_slice(body);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request<R>(reader: &mut R, max_len: usize) -> Result<Option<Request>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_len).await? {
        Some(body) => Request::decode(&body).map(Some),
        None => Ok(None),
    }
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &request.encode()?).await
}

/// Reads exactly one reply; a closed stream is an error because a reply was owed.
pub async fn read_reply<R>(reader: &mut R, max_len: usize) -> Result<Reply, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_len).await? {
        Some(body) => Reply::decode(&body),
        None => Err(FrameError::Truncated),
    }
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &reply.encode()?).await
}

fn malformed(err: serde_json::Error) -> FrameError {
    FrameError::Malformed(err.to_string())
}
