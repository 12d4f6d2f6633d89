//! Authenticator capability (spec.md §4.2, §9): credential verification and
//! user-to-worker routing, modeled as a capability set rather than a class
//! hierarchy. Two concrete backends — [`file_store::FileAuthenticator`] and
//! [`sql_store::SqlAuthenticator`] — implement the same trait.

pub mod file_store;
pub mod sql_store;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::model::WorkerDescriptor;

/// Result of a successful PLAIN authentication: the user's stable id and
/// their deterministic session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub user_id: u64,
    pub session_id: String,
}

/// The capability surface an authentication backend must provide.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `user`/`pass` against the backing store. On success, returns
    /// the stable id and the `clientAddr:userName` session id.
    async fn authenticate_plain(
        &self,
        user: &str,
        pass: &str,
        client_addr: &str,
    ) -> AppResult<Authenticated>;
}

/// Linear scan over worker descriptors for the unique worker whose range
/// contains `user_id`. Fails with a config error if none match — this
/// indicates misconfiguration, not a transient condition (spec.md §4.2).
pub fn get_worker_for_user<'a>(
    workers: &'a [WorkerDescriptor],
    user_id: u64,
) -> AppResult<&'a WorkerDescriptor> {
    workers
        .iter()
        .find(|w| w.owns(user_id))
        .ok_or_else(|| AppError::config(format!("no worker configured for user id {user_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers() -> Vec<WorkerDescriptor> {
        vec![
            WorkerDescriptor {
                name: "w1".into(),
                public_addr: "0.0.0.0:1430".into(),
                internal_addr: "127.0.0.1:5001".into(),
                user_start: 1,
                user_end: 100,
                secondary_name: Some("w2".into()),
            },
            WorkerDescriptor {
                name: "w2".into(),
                public_addr: "0.0.0.0:1431".into(),
                internal_addr: "127.0.0.1:5002".into(),
                user_start: 101,
                user_end: 200,
                secondary_name: Some("w1".into()),
            },
        ]
    }

    #[test]
    fn finds_unique_owning_worker() {
        let ws = workers();
        assert_eq!(get_worker_for_user(&ws, 7).unwrap().name, "w1");
        assert_eq!(get_worker_for_user(&ws, 150).unwrap().name, "w2");
    }

    #[test]
    fn fails_with_config_error_when_no_worker_owns_the_id() {
        let ws = workers();
        let err = get_worker_for_user(&ws, 500).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
