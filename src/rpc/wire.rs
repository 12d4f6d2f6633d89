//! Length-delimited request/response framing shared by every internal RPC
//! call, client and server side.
//!
//! Request frame: `[1-byte method id][4-byte BE length][prost-encoded
//! request]`. Response frame: `[1-byte status][4-byte BE length][payload]`.
//! `status` distinguishes the two failure modes spec.md §7 cares about:
//! `Unavailable` (retryable, drives failover) from anything else (fatal).

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{AppError, AppResult};
use crate::rpc::MethodId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Unavailable = 1,
    Fatal = 2,
}

impl Status {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Unavailable),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write a request frame: method id, then the prost-encoded message.
pub async fn write_request<S, Req>(stream: &mut S, method: MethodId, req: &Req) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
    Req: Message,
{
    let payload = req.encode_to_vec();
    stream.write_u8(method as u8).await?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a request frame header and payload. Returns `None` on clean EOF
/// before any bytes of a new frame arrive (the peer closed the connection).
pub async fn read_request<S>(stream: &mut S) -> AppResult<Option<(MethodId, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let method_byte = match stream.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let method = MethodId::from_u8(method_byte)
        .ok_or_else(|| AppError::Protocol(format!("unknown RPC method id {method_byte}")))?;
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(AppError::Protocol(format!("RPC frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some((method, payload)))
}

/// Write a successful response frame.
pub async fn write_response_ok<S, Resp>(stream: &mut S, resp: &Resp) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
    Resp: Message,
{
    write_response_raw(stream, Status::Ok, &resp.encode_to_vec()).await
}

/// Write an error response frame; `unavailable` selects the retryable
/// status, matching spec.md §7's transport-transient vs transport-fatal
/// distinction.
pub async fn write_response_err<S>(stream: &mut S, message: &str, unavailable: bool) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    let status = if unavailable { Status::Unavailable } else { Status::Fatal };
    write_response_raw(stream, status, message.as_bytes()).await
}

async fn write_response_raw<S>(stream: &mut S, status: Status, payload: &[u8]) -> AppResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(status as u8).await?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a response frame and decode it, mapping a non-`Ok` status to the
/// matching [`AppError`] variant.
pub async fn read_response<S, Resp>(stream: &mut S) -> AppResult<Resp>
where
    S: AsyncRead + Unpin,
    Resp: Message + Default,
{
    let status_byte = stream.read_u8().await?;
    let status = Status::from_u8(status_byte)
        .ok_or_else(|| AppError::TransportFatal(format!("unknown RPC status {status_byte}")))?;
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(AppError::TransportFatal(format!("RPC frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;

    match status {
        Status::Ok => Resp::decode(payload.as_slice())
            .map_err(|e| AppError::TransportFatal(format!("malformed RPC response: {e}"))),
        Status::Unavailable => Err(AppError::Transport(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        Status::Fatal => Err(AppError::TransportFatal(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
    }
}
