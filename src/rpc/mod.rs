//! The internal RPC surface (spec.md §4.6, §6) and the CRDT fan-out surface
//! (spec.md §4.7, §4.8).
//!
//! Message types are generated from `proto/distmail.proto` by `build.rs`
//! (field numbers there are explicit and additive, per spec.md §6). The
//! `service` blocks in that file are surface documentation only — prost
//! does not generate client/server code for them, since the back-end that
//! implements `NodeService` is out of scope here (spec.md §1). Dispatch for
//! the calls this repo *does* make or serve (the full `NodeService` client
//! side, and the `ReplicatorService::Incoming` client and server side) is
//! hand-rolled length-delimited framing in [`wire`], matching the same
//! "length-prefixed binary record" idea spec.md §3 already uses for the
//! replication log.

pub mod client;
pub mod server;
pub mod wire;

include!(concat!(env!("OUT_DIR"), "/distmail.rpc.rs"));

/// One byte identifying which `NodeService`/`ReplicatorService` method a
/// request frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MethodId {
    Prepare = 1,
    Select = 2,
    Create = 3,
    Delete = 4,
    List = 5,
    Expunge = 6,
    Store = 7,
    Append = 8,
    SessionDone = 9,
    Incoming = 20,
}

impl MethodId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Prepare),
            2 => Some(Self::Select),
            3 => Some(Self::Create),
            4 => Some(Self::Delete),
            5 => Some(Self::List),
            6 => Some(Self::Expunge),
            7 => Some(Self::Store),
            8 => Some(Self::Append),
            9 => Some(Self::SessionDone),
            20 => Some(Self::Incoming),
            _ => None,
        }
    }
}
