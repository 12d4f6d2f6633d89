//! Core data model (spec.md §3): users, worker descriptors, sessions, the
//! IMAP request tuple, and the vector clock.

use std::collections::BTreeMap;

use crate::rpc;

/// A registered mailbox user.
///
/// Ids are assigned in file-scan order and are stable for the life of the
/// process (spec.md §3); no two users share a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub secret: String,
}

/// Describes one back-end worker/storage node and the contiguous user-id
/// range it owns.
///
/// Invariant: across all configured workers, the `[user_start, user_end]`
/// ranges are a disjoint cover of the active user-id space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub public_addr: String,
    pub internal_addr: String,
    pub user_start: u64,
    pub user_end: u64,
    pub secondary_name: Option<String>,
}

impl WorkerDescriptor {
    pub fn owns(&self, user_id: u64) -> bool {
        self.user_start <= user_id && user_id <= self.user_end
    }
}

/// The logical client conversation between LOGIN and LOGOUT.
///
/// `session_id` is deterministic (`clientAddr:userName`) so a failed-over
/// replica can identify the same logical session without a session token
/// (spec.md §9 Open Questions: tokens are deliberately not reintroduced).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_addr: String,
    pub user_name: String,
    pub user_id: u64,
}

impl SessionInfo {
    pub fn new(client_addr: impl Into<String>, user_name: impl Into<String>, user_id: u64) -> Self {
        Self {
            client_addr: client_addr.into(),
            user_name: user_name.into(),
            user_id,
        }
    }

    /// `"<clientAddr>:<userName>"`, stable across failover.
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.client_addr, self.user_name)
    }
}

/// A parsed IMAP client request line: `<tag> <COMMAND> <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapRequest {
    pub tag: String,
    pub command: String,
    pub payload: String,
}

impl ImapRequest {
    /// Split a line on whitespace: first token is the tag, second
    /// (uppercased) is the command, the remainder (original spacing
    /// preserved) is the payload. Lines with fewer than two tokens are
    /// malformed (spec.md §4.3).
    pub fn parse(line: &str) -> Option<Self> {
        let tag_end = line.find(char::is_whitespace)?;
        let tag = &line[..tag_end];
        let rest = line[tag_end..].trim_start();
        let cmd_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let command = &rest[..cmd_end];
        if command.is_empty() {
            return None;
        }
        let payload = rest[cmd_end..].trim_start();
        Some(Self {
            tag: tag.to_owned(),
            command: command.to_ascii_uppercase(),
            payload: payload.to_owned(),
        })
    }

    /// Rebuild `tag SP command SP payload`, collapsing payload-less
    /// requests to `tag SP command`.
    pub fn to_line(&self) -> String {
        if self.payload.is_empty() {
            format!("{} {}", self.tag, self.command)
        } else {
            format!("{} {} {}", self.tag, self.command, self.payload)
        }
    }

    pub fn args(&self) -> Vec<&str> {
        if self.payload.is_empty() {
            Vec::new()
        } else {
            self.payload.split_whitespace().collect()
        }
    }
}

/// Mapping from replica name to a monotonically non-decreasing counter.
/// Missing entries are treated as zero (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    counters: BTreeMap<String, u32>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &str) -> u32 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// Increment `replica`'s counter by one and return the new value.
    pub fn increment(&mut self, replica: &str) -> u32 {
        let counter = self.counters.entry(replica.to_owned()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// `true` if `self` is component-wise >= `other`, and strictly greater
    /// in at least one component.
    pub fn happens_after(&self, other: &Self) -> bool {
        let replicas = self.counters.keys().chain(other.counters.keys());
        let mut strictly_greater = false;
        for replica in replicas {
            let ours = self.get(replica);
            let theirs = other.get(replica);
            if ours < theirs {
                return false;
            }
            if ours > theirs {
                strictly_greater = true;
            }
        }
        strictly_greater
    }

    pub fn to_proto(&self) -> rpc::VectorClock {
        rpc::VectorClock {
            counters: self
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    pub fn from_proto(proto: rpc::VectorClock) -> Self {
        Self {
            counters: proto.counters.into_iter().collect(),
        }
    }
}
