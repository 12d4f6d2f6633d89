//! SQL-backed Authenticator (spec.md §4.2).
//!
//! Hashes the supplied password with SHA-512, base64-encodes the digest,
//! and compares it against the stored hash in a single parameterized
//! query — the database never sees (or stores) a plaintext password.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha512};
use sqlx::SqlitePool;

use super::{Authenticated, Authenticator};
use crate::errors::{AppError, AppResult};

const SELECT_USER_BY_CREDENTIALS: &str =
    "SELECT id FROM users WHERE name = ? AND secret_sha512 = ?";

/// Authenticator backed by a `users(id, name, secret_sha512)` table.
pub struct SqlAuthenticator {
    pool: SqlitePool,
}

impl SqlAuthenticator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| AppError::config(format!("cannot connect to auth database: {e}")))?;
        Ok(Self::new(pool))
    }
}

fn hash_password(password: &str) -> String {
    let digest = Sha512::digest(password.as_bytes());
    BASE64.encode(digest)
}

#[async_trait]
impl Authenticator for SqlAuthenticator {
    async fn authenticate_plain(
        &self,
        user: &str,
        pass: &str,
        client_addr: &str,
    ) -> AppResult<Authenticated> {
        let hashed = hash_password(pass);
        let row: Option<(i64,)> = sqlx::query_as(SELECT_USER_BY_CREDENTIALS)
            .bind(user)
            .bind(&hashed)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Transport(format!("auth query failed: {e}")))?;

        let (id,) = row.ok_or_else(|| {
            AppError::AuthFailed(format!("no such user or bad password: {user}"))
        })?;

        Ok(Authenticated {
            user_id: id as u64,
            session_id: format!("{client_addr}:{user}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_base64_sha512_and_deterministic() {
        let a = hash_password("s3cret");
        let b = hash_password("s3cret");
        assert_eq!(a, b);
        // SHA-512 is 64 bytes; base64 (no padding stripped here) is 88 chars.
        assert_eq!(a.len(), 88);
        assert_ne!(a, hash_password("different"));
    }
}
