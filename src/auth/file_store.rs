//! File-backed Authenticator (spec.md §4.2, §6).
//!
//! One record per line: `<user><sep><password>`, `sep` configurable
//! (default `:`). Loaded once at startup, sorted by name for binary-search
//! lookup. Ids are assigned by 1-based file-scan order, before sorting —
//! this is what makes them stable across a run even though the lookup
//! table itself is kept sorted.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use super::{Authenticated, Authenticator};
use crate::errors::{AppError, AppResult};
use crate::model::User;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    user: User,
}

/// Authenticator backed by a flat `user<sep>password` file, loaded once.
pub struct FileAuthenticator {
    /// Sorted by `user.name` for binary search.
    entries: Vec<Entry>,
}

impl FileAuthenticator {
    /// Load and parse the file, assigning ids in scan order, then sort by
    /// name for lookup.
    pub async fn load(path: &Path, separator: char) -> AppResult<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| AppError::config(format!("cannot read auth file {path:?}: {e}")))?;
        Self::parse(&contents, separator)
    }

    fn parse(contents: &str, separator: char) -> AppResult<Self> {
        let mut entries = Vec::new();
        let mut next_id = 1u64;
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            let (name, secret) = line.split_once(separator).ok_or_else(|| {
                AppError::config(format!(
                    "malformed auth file record on line {}: missing separator",
                    line_no + 1
                ))
            })?;
            if name.is_empty() {
                return Err(AppError::config(format!(
                    "malformed auth file record on line {}: empty user name",
                    line_no + 1
                )));
            }
            entries.push(Entry {
                user: User {
                    id: next_id,
                    name: name.to_owned(),
                    secret: secret.to_owned(),
                },
            });
            next_id += 1;
        }

        let mut names_seen = entries.iter().map(|e| e.user.name.clone()).collect::<Vec<_>>();
        names_seen.sort_unstable();
        names_seen.dedup();
        if names_seen.len() != entries.len() {
            return Err(AppError::config(
                "malformed auth file: duplicate user name".to_owned(),
            ));
        }

        entries.sort_by(|a, b| a.user.name.cmp(&b.user.name));
        Ok(Self { entries })
    }

    fn find(&self, name: &str) -> Option<&User> {
        self.entries
            .binary_search_by(|entry| entry.user.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx].user)
    }
}

/// Compare two byte strings without an early-exit short circuit on the
/// first mismatching byte, so that failure latency for wrong-length or
/// wrong-content secrets doesn't leak which byte differed.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[async_trait]
impl Authenticator for FileAuthenticator {
    async fn authenticate_plain(
        &self,
        user: &str,
        pass: &str,
        client_addr: &str,
    ) -> AppResult<Authenticated> {
        let found = self.find(user);
        let ok = found
            .map(|u| constant_time_eq(u.secret.as_bytes(), pass.as_bytes()))
            .unwrap_or(false);
        if !ok {
            return Err(AppError::AuthFailed(format!("no such user or bad password: {user}")));
        }
        let user_id = found.expect("checked above").id;
        Ok(Authenticated {
            user_id,
            session_id: format!("{client_addr}:{user}"),
        })
    }
}
