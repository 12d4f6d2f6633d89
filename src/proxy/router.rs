//! Proxy Router (spec.md §4.5): holds the live RPC channel to an
//! authenticated session's owning back-end, tunnels commands, ferries
//! APPEND literal bytes, and fails over to a secondary worker on error.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;

use crate::errors::{AppError, AppResult};
use crate::model::WorkerDescriptor;
use crate::rpc::client::{CommandArgs, NodeClient, ReplyArgs, WireNodeClient};

/// Delay between failed dial attempts in [`ProxyRouter::connect`], to avoid
/// a hot retry loop while a node stays unreachable.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Builds RPC channels to back-end nodes over the internal mTLS config
/// (spec.md §4.1).
pub struct ProxyRouter {
    tls_config: Arc<ClientConfig>,
}

impl ProxyRouter {
    pub fn new(tls_config: Arc<ClientConfig>) -> Self {
        Self { tls_config }
    }

    /// Dial `primary`, then `secondary` on error, then retry `primary`,
    /// looping until one succeeds (spec.md §4.5). Returns the name of the
    /// node actually connected to.
    pub async fn connect(
        &self,
        primary: &WorkerDescriptor,
        secondary: Option<&WorkerDescriptor>,
    ) -> AppResult<(String, WireNodeClient)> {
        let candidates: Vec<&WorkerDescriptor> = match secondary {
            Some(s) => vec![primary, s],
            None => vec![primary],
        };

        let mut attempt = 0usize;
        loop {
            let worker = candidates[attempt % candidates.len()];
            match self.dial(worker).await {
                Ok(client) => return Ok((worker.name.clone(), client)),
                Err(e) => {
                    tracing::warn!(worker = %worker.name, error = %e, "dial failed, trying next candidate");
                    attempt += 1;
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn dial(&self, worker: &WorkerDescriptor) -> AppResult<WireNodeClient> {
        let server_name = server_name_for_addr(&worker.internal_addr)?;
        WireNodeClient::dial(&worker.internal_addr, self.tls_config.clone(), server_name).await
    }
}

/// Derive a TLS `ServerName` from a `host:port` address: an IP literal if
/// the host parses as one, otherwise a DNS name.
fn server_name_for_addr(addr: &str) -> AppResult<ServerName<'static>> {
    let host = addr
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(addr);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|e| AppError::config(format!("invalid internal address '{addr}': {e}")))
}

/// Live state for one authenticated session's back-end connection
/// (spec.md §3 `Session`). Owned exclusively by the client's session task.
pub struct ProxySession {
    primary: WorkerDescriptor,
    secondary: Option<WorkerDescriptor>,
    actual_name: String,
    client: WireNodeClient,
    pub session_id: String,
    pub user_name: String,
}

impl ProxySession {
    /// Open the initial connection for a freshly authenticated session.
    pub async fn login(
        router: &ProxyRouter,
        primary: WorkerDescriptor,
        secondary: Option<WorkerDescriptor>,
        session_id: String,
        user_name: String,
    ) -> AppResult<Self> {
        let (actual_name, client) = router.connect(&primary, secondary.as_ref()).await?;
        Ok(Self {
            primary,
            secondary,
            actual_name,
            client,
            session_id,
            user_name,
        })
    }

    /// Tunnel one proxied command (spec.md §4.5). `literal` carries the
    /// APPEND payload on the second round; every other command passes
    /// `None`. Only a retryable transport error (spec.md §7
    /// transport-transient) fails over and retries the command once; every
    /// other error (protocol, transport-fatal) propagates immediately so
    /// the caller terminates the session instead of masking it.
    pub async fn tunnel(
        &mut self,
        router: &ProxyRouter,
        command: &str,
        cmd: CommandArgs,
        literal: Option<Vec<u8>>,
    ) -> AppResult<ReplyArgs> {
        match dispatch(&mut self.client, command, cmd.clone(), literal.clone()).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_retryable_transport() => {
                tracing::warn!(node = %self.actual_name, error = %e, "proxied command failed, failing over");
                self.failover(router).await?;
                dispatch(&mut self.client, command, cmd, literal).await
            }
            Err(e) => Err(e),
        }
    }

    /// End the session at the currently connected node.
    pub async fn session_done(&mut self, remove: bool) -> AppResult<()> {
        self.client.session_done(&self.session_id, remove).await
    }

    async fn failover(&mut self, router: &ProxyRouter) -> AppResult<()> {
        let (actual_name, client) = router.connect(&self.primary, self.secondary.as_ref()).await?;
        let migrated = actual_name != self.actual_name;
        self.actual_name = actual_name;
        self.client = client;
        if migrated {
            let primary_name = self.primary.name.clone();
            self.client
                .prepare(&self.session_id, &self.user_name, &primary_name)
                .await?;
        }
        Ok(())
    }
}

async fn dispatch(
    client: &mut WireNodeClient,
    command: &str,
    cmd: CommandArgs,
    literal: Option<Vec<u8>>,
) -> AppResult<ReplyArgs> {
    match command {
        "SELECT" => client.select(cmd).await,
        "CREATE" => client.create(cmd).await,
        "DELETE" => client.delete(cmd).await,
        "LIST" => client.list(cmd).await,
        "EXPUNGE" => client.expunge(cmd).await,
        "STORE" => client.store(cmd).await,
        "APPEND" => client.append(cmd, literal).await,
        other => Err(AppError::protocol(format!("command {other} is not proxied"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_prefers_ip_literal() {
        let name = server_name_for_addr("127.0.0.1:5001").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn server_name_falls_back_to_dns_name() {
        let name = server_name_for_addr("worker-1.internal:5001").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }
}
