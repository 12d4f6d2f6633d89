//! Asynchronous CRDT replication between worker replicas (spec.md §4.7,
//! §4.8): a durable, head-truncated log; a sender that stamps and ships it;
//! and a receiver that persists and acknowledges what arrives.

pub mod log;
pub mod receiver;
pub mod sender;
pub mod vector_clock;

pub use log::ReplicationLog;
pub use receiver::CrdtReceiver;
pub use sender::{CrdtSender, PeerTarget};
