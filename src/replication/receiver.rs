//! The CRDT receiver (spec.md §4.8): the server-side counterpart to
//! [`super::sender`]. Persists an inbound batch to a local log durably
//! before acknowledging it, then signals the task that applies the
//! contained ops to local state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{AppError, AppResult};
use crate::replication::log::ReplicationLog;
use crate::rpc::server::IncomingHandler;

/// Persists every accepted batch and hands it to an applier task over an
/// unbounded channel. A full or closed channel is treated as state-fatal:
/// silently dropping an acknowledged batch would violate the "ack implies
/// durable and eventually applied" guarantee (spec.md §4.8).
pub struct CrdtReceiver {
    log: Arc<ReplicationLog>,
    applier_tx: mpsc::Sender<Vec<u8>>,
}

impl CrdtReceiver {
    pub fn new(log: Arc<ReplicationLog>, applier_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { log, applier_tx }
    }
}

#[async_trait]
impl IncomingHandler for CrdtReceiver {
    async fn incoming(&self, batch: Vec<u8>) -> AppResult<()> {
        self.log.append_raw(&batch).await?;
        self.applier_tx
            .send(batch)
            .await
            .map_err(|_| AppError::StateFatal("applier task is gone".into()))?;
        Ok(())
    }
}
