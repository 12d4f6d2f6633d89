//! Server-side dispatch for connections accepted on the internal mTLS
//! listener.
//!
//! This repo only ever serves one method for real:
//! `ReplicatorService::Incoming` (spec.md §4.8) — the `NodeService` methods
//! (Prepare/Select/.../SessionDone) are mailbox semantics owned by the
//! out-of-scope back-end (spec.md §1), so a connection that asks for one of
//! those gets a fatal "not implemented" reply rather than silently hanging.

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::AppResult;
use crate::rpc::wire;
use crate::rpc::{Ack, BinMsgs, MethodId};

/// Handles a CRDT batch received from a peer (spec.md §4.8): persist it to
/// the local inbound log and signal the local applier.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn incoming(&self, batch: Vec<u8>) -> AppResult<()>;
}

/// Serve requests on one accepted connection until the peer closes it or a
/// framing error occurs.
pub async fn serve_connection<S, H>(mut stream: S, handler: Arc<H>) -> AppResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: IncomingHandler + 'static,
{
    loop {
        let Some((method, payload)) = wire::read_request(&mut stream).await? else {
            return Ok(());
        };

        match method {
            MethodId::Incoming => {
                let batch = match BinMsgs::decode(payload.as_slice()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        wire::write_response_err(&mut stream, &format!("malformed BinMsgs: {e}"), false)
                            .await?;
                        continue;
                    }
                };
                match handler.incoming(batch.data).await {
                    Ok(()) => wire::write_response_ok(&mut stream, &Ack { status: 0 }).await?,
                    Err(e) => {
                        wire::write_response_err(&mut stream, &e.to_string(), e.is_retryable_transport())
                            .await?
                    }
                }
            }
            _ => {
                wire::write_response_err(
                    &mut stream,
                    "method not implemented by this node",
                    false,
                )
                .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        received: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl IncomingHandler for RecordingHandler {
        async fn incoming(&self, batch: Vec<u8>) -> AppResult<()> {
            self.received.lock().unwrap().push(batch);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_incoming_and_acks() {
        let (client_stream, server_stream) = tokio::io::duplex(8192);
        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let handler_clone = handler.clone();
        let server_task = tokio::spawn(async move {
            serve_connection(server_stream, handler_clone).await.unwrap();
        });

        let mut client_side = client_stream;
        wire::write_request(
            &mut client_side,
            MethodId::Incoming,
            &BinMsgs { data: b"batch-2".to_vec() },
        )
        .await
        .unwrap();
        let ack: Ack = wire::read_response(&mut client_side).await.unwrap();
        assert_eq!(ack.status, 0);
        assert_eq!(handler.received.lock().unwrap()[0], b"batch-2");

        drop(client_side);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn unimplemented_method_gets_a_fatal_reply() {
        let (mut client_side, server_stream) = tokio::io::duplex(8192);
        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let server_task = tokio::spawn(async move {
            serve_connection(server_stream, handler).await.unwrap();
        });

        wire::write_request(
            &mut client_side,
            MethodId::Select,
            &BinMsgs { data: Vec::new() },
        )
        .await
        .unwrap();
        let err = wire::read_response::<_, Ack>(&mut client_side).await.unwrap_err();
        assert!(!err.is_retryable_transport());

        drop(client_side);
        server_task.await.unwrap();
    }
}
