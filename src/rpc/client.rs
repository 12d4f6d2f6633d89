//! Client-side callers for the internal RPC surface.
//!
//! [`NodeClient`] is the capability the Proxy Router (spec.md §4.5) holds
//! per session; it is consumed here, not implemented — the server side
//! (mailbox semantics) is the out-of-scope back-end (spec.md §1, §4.6).
//! [`ReplicatorPeerClient`] is the CRDT sender's (spec.md §4.7) caller into
//! a peer's [`super::server::IncomingHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::errors::{AppError, AppResult};
use crate::rpc::wire;
use crate::rpc::{
    Ack, AwaitLiteral, BinMsgs, Command, PrepareReply, PrepareRequest, Reply, SessionDoneReply,
    SessionDoneRequest,
};
use crate::rpc::MethodId;

/// Arguments for a single-round proxied command (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct CommandArgs {
    pub text: String,
    pub session_id: String,
    pub user_name: String,
}

impl CommandArgs {
    fn into_proto(self, literal: Option<Vec<u8>>) -> Command {
        Command {
            text: self.text,
            session_id: self.session_id,
            user_name: self.user_name,
            literal,
        }
    }
}

/// Reply to a proxied command: the verbatim text to forward to the client,
/// and (for the first round of APPEND) how many literal bytes to await.
#[derive(Debug, Clone)]
pub struct ReplyArgs {
    pub text: String,
    pub awaited_num_bytes: Option<u32>,
}

impl From<Reply> for ReplyArgs {
    fn from(reply: Reply) -> Self {
        Self {
            text: reply.text,
            awaited_num_bytes: reply.is_append.map(|a| a.awaited_num_bytes),
        }
    }
}

/// The back-end RPC surface a worker/storage node exposes (spec.md §4.6),
/// from the caller's point of view.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn prepare(&mut self, session_id: &str, user_name: &str, primary_name: &str) -> AppResult<()>;
    async fn select(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn create(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn delete(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn list(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn expunge(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn store(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs>;
    async fn append(&mut self, cmd: CommandArgs, literal: Option<Vec<u8>>) -> AppResult<ReplyArgs>;
    async fn session_done(&mut self, session_id: &str, remove: bool) -> AppResult<()>;
}

/// A `NodeClient` backed by a single persistent mTLS connection, speaking
/// the length-delimited request/response framing in [`wire`].
pub struct WireNodeClient {
    stream: TlsStream<TcpStream>,
}

impl WireNodeClient {
    /// Dial `addr` over TCP, then perform the internal mTLS handshake.
    pub async fn dial(
        addr: &str,
        tls_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> AppResult<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| AppError::Transport(format!("dial {addr} failed: {e}")))?;
        let connector = TlsConnector::from(tls_config);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AppError::Transport(format!("TLS handshake with {addr} failed: {e}")))?;
        Ok(Self { stream })
    }

    async fn call<Req, Resp>(&mut self, method: MethodId, req: &Req) -> AppResult<Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        wire::write_request(&mut self.stream, method, req).await?;
        wire::read_response(&mut self.stream).await
    }
}

#[async_trait]
impl NodeClient for WireNodeClient {
    async fn prepare(&mut self, session_id: &str, user_name: &str, primary_name: &str) -> AppResult<()> {
        let req = PrepareRequest {
            session_id: session_id.to_owned(),
            user_name: user_name.to_owned(),
            primary_name: primary_name.to_owned(),
        };
        let _: PrepareReply = self.call(MethodId::Prepare, &req).await?;
        Ok(())
    }

    async fn select(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::Select, &req).await?;
        Ok(reply.into())
    }

    async fn create(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::Create, &req).await?;
        Ok(reply.into())
    }

    async fn delete(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::Delete, &req).await?;
        Ok(reply.into())
    }

    async fn list(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::List, &req).await?;
        Ok(reply.into())
    }

    async fn expunge(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::Expunge, &req).await?;
        Ok(reply.into())
    }

    async fn store(&mut self, cmd: CommandArgs) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(None);
        let reply: Reply = self.call(MethodId::Store, &req).await?;
        Ok(reply.into())
    }

    async fn append(&mut self, cmd: CommandArgs, literal: Option<Vec<u8>>) -> AppResult<ReplyArgs> {
        let req = cmd.into_proto(literal);
        let reply: Reply = self.call(MethodId::Append, &req).await?;
        Ok(reply.into())
    }

    async fn session_done(&mut self, session_id: &str, remove: bool) -> AppResult<()> {
        let req = SessionDoneRequest {
            session_id: session_id.to_owned(),
            remove,
        };
        let _: SessionDoneReply = self.call(MethodId::SessionDone, &req).await?;
        Ok(())
    }
}

/// Caller used by the CRDT shipper (spec.md §4.7) to fan a batch out to one
/// peer's `ReplicatorService::Incoming`.
pub struct ReplicatorPeerClient {
    stream: TlsStream<TcpStream>,
}

impl ReplicatorPeerClient {
    pub async fn dial(
        addr: &str,
        tls_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> AppResult<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| AppError::Transport(format!("dial {addr} failed: {e}")))?;
        let connector = TlsConnector::from(tls_config);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AppError::Transport(format!("TLS handshake with {addr} failed: {e}")))?;
        Ok(Self { stream })
    }

    pub async fn incoming(&mut self, data: Vec<u8>) -> AppResult<Ack> {
        let req = BinMsgs { data };
        wire::write_request(&mut self.stream, MethodId::Incoming, &req).await?;
        wire::read_response(&mut self.stream).await
    }
}
