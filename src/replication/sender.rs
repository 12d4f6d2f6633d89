//! The CRDT sender (spec.md §4.7): a broker task that stamps and durably
//! logs every local mutation, and a shipper task that periodically fans
//! the log out to every peer replica and trims what every peer has
//! acknowledged.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::sync::mpsc;

use crate::errors::{AppError, AppResult};
use crate::replication::log::{self, ReplicationLog};
use crate::replication::vector_clock;
use crate::rpc::client::ReplicatorPeerClient;
use crate::rpc::DownstreamMessage;

/// Default interval between shipper ticks (spec.md §4.7).
pub const DEFAULT_SHIP_INTERVAL: Duration = Duration::from_secs(3);

/// One replica the shipper fans batches out to.
#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub name: String,
    pub addr: String,
    pub server_name: ServerName<'static>,
}

/// Owns the replication log shared between the broker and shipper tasks.
pub struct CrdtSender {
    log: Arc<ReplicationLog>,
}

impl CrdtSender {
    pub fn new(log: Arc<ReplicationLog>) -> Self {
        Self { log }
    }

    /// Broker loop (spec.md §4.7): serialize one op at a time, stamp it with
    /// this replica's vector clock, and append it to the log before taking
    /// the next one. Runs until `ops` closes.
    pub async fn run_broker(&self, replica_name: String, mut ops: mpsc::Receiver<Vec<u8>>) -> AppResult<()> {
        let mut clock_handle = vector_clock::spawn();

        while let Some(op) = ops.recv().await {
            let vclock = clock_handle.tick(&replica_name).await;
            let msg = DownstreamMessage {
                replica: replica_name.clone(),
                vclock: Some(vclock.to_proto()),
                op,
            };
            let encoded = msg.encode_to_vec();
            self.log.append(&log::encode_record(&encoded)).await?;
        }
        Ok(())
    }

    /// Shipper loop (spec.md §4.7): every `interval`, read the whole log,
    /// fan it out to every peer concurrently, and truncate the shipped
    /// prefix once every peer has acknowledged it. A peer reporting
    /// `Unavailable` is retried forever without holding up the others; any
    /// other failure aborts the replica (state-fatal, spec.md §7).
    pub async fn run_shipper(
        &self,
        peers: Vec<PeerTarget>,
        tls_config: Arc<ClientConfig>,
        interval: Duration,
    ) -> AppResult<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = self.log.read_snapshot().await?;
            if snapshot.is_empty() {
                continue;
            }

            let dispatches = peers.iter().map(|peer| {
                ship_until_acked(peer.clone(), tls_config.clone(), snapshot.clone(), interval)
            });
            futures::future::try_join_all(dispatches).await?;

            self.log.truncate_prefix(snapshot.len()).await?;
        }
    }
}

/// Ship `data` to one peer, retrying indefinitely while it reports
/// `Unavailable`. Returns once that peer has acknowledged, or propagates a
/// fatal error (bad ack status, non-transient transport failure).
async fn ship_until_acked(
    peer: PeerTarget,
    tls_config: Arc<ClientConfig>,
    data: Vec<u8>,
    retry_backoff: Duration,
) -> AppResult<()> {
    loop {
        match try_ship(&peer, tls_config.clone(), data.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable_transport() => {
                tracing::warn!(peer = %peer.name, error = %e, "peer unavailable, retrying");
                tokio::time::sleep(retry_backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_ship(peer: &PeerTarget, tls_config: Arc<ClientConfig>, data: Vec<u8>) -> AppResult<()> {
    let mut client = ReplicatorPeerClient::dial(&peer.addr, tls_config, peer.server_name.clone()).await?;
    let ack = client.incoming(data).await?;
    if ack.status != 0 {
        return Err(AppError::StateFatal(format!(
            "peer {} rejected batch with status {}",
            peer.name, ack.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broker_stamps_and_appends_each_op_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ReplicationLog::new(dir.path().join("out.log")));
        let sender = CrdtSender::new(log.clone());
        let (tx, rx) = mpsc::channel(4);

        let broker = tokio::spawn(async move { sender.run_broker("r1".to_owned(), rx).await });
        tx.send(b"op-a".to_vec()).await.unwrap();
        tx.send(b"op-b".to_vec()).await.unwrap();
        drop(tx);
        broker.await.unwrap().unwrap();

        let snapshot = log.read_snapshot().await.unwrap();
        let records = log::parse_records(&snapshot).unwrap();
        assert_eq!(records.len(), 2);

        let first = DownstreamMessage::decode(records[0]).unwrap();
        assert_eq!(first.replica, "r1");
        assert_eq!(first.op, b"op-a");
        assert_eq!(first.vclock.unwrap().counters.get("r1"), Some(&1));

        let second = DownstreamMessage::decode(records[1]).unwrap();
        assert_eq!(second.vclock.unwrap().counters.get("r1"), Some(&2));
    }
}
