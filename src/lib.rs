//! Distributed IMAPv4 mail service core.
//!
//! - [`errors`]: the crate-wide error taxonomy and its mapping to IMAP
//!   reply text, retry policy, and fatality.
//! - [`model`]: shared data types — users, worker descriptors, sessions,
//!   IMAP requests, vector clocks.
//! - [`tls`]: the TLS Factory building the public and internal mTLS
//!   transport configs every listener and dialer uses.
//! - [`auth`]: the Authenticator capability and its file- and SQL-backed
//!   implementations.
//! - [`rpc`]: the hand-rolled length-delimited wire protocol and its
//!   client/server halves.
//! - [`imap`]: client-facing line framing and the per-connection session
//!   state machine.
//! - [`proxy`]: the router that tunnels an authenticated session's
//!   commands to its owning back-end, with failover.
//! - [`replication`]: the durable log, CRDT sender, and CRDT receiver that
//!   move mutations between worker replicas.
//! - [`config`]: environment-variable configuration for both binaries.

pub mod auth;
pub mod config;
pub mod errors;
pub mod imap;
pub mod model;
pub mod proxy;
pub mod replication;
pub mod rpc;
pub mod tls;
