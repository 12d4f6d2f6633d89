//! Configuration (ambient stack): both binaries load all settings from
//! environment variables following the pattern `DISTMAIL_<SEGMENT>_<KEY>`.
//! Worker and peer segments are discovered by scanning for their defining
//! variable, the same way account segments would be discovered by host
//! variable in a single-account IMAP client config.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::errors::{AppError, AppResult};
use crate::model::WorkerDescriptor;

/// Where the distributor's Authenticator capability gets its data.
#[derive(Debug, Clone)]
pub enum AuthBackendConfig {
    File { path: PathBuf, separator: char },
    Sql { database_url: String },
}

/// Everything `distmail-distributor` needs to start (spec.md §4.1, §4.2,
/// §4.5).
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub listen_addr: String,
    pub public_cert_path: PathBuf,
    pub public_key_path: PathBuf,
    pub internal_ca_path: PathBuf,
    pub internal_cert_path: PathBuf,
    pub internal_key_path: PathBuf,
    pub auth_backend: AuthBackendConfig,
    pub workers: Vec<WorkerDescriptor>,
}

impl DistributorConfig {
    pub fn load_from_env() -> AppResult<Self> {
        let workers = load_workers()?;
        if workers.is_empty() {
            return Err(AppError::config(
                "no workers configured (no DISTMAIL_WORKER_*_PUBLIC_ADDR variables found)",
            ));
        }

        Ok(Self {
            listen_addr: env_or("DISTMAIL_LISTEN_ADDR", "0.0.0.0:1430"),
            public_cert_path: required_path_env("DISTMAIL_PUBLIC_CERT")?,
            public_key_path: required_path_env("DISTMAIL_PUBLIC_KEY")?,
            internal_ca_path: required_path_env("DISTMAIL_INTERNAL_CA")?,
            internal_cert_path: required_path_env("DISTMAIL_INTERNAL_CERT")?,
            internal_key_path: required_path_env("DISTMAIL_INTERNAL_KEY")?,
            auth_backend: load_auth_backend()?,
            workers,
        })
    }
}

/// Everything `distmail-replicator` needs to start (spec.md §4.1, §4.7,
/// §4.8).
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub replica_name: String,
    pub listen_addr: String,
    pub internal_ca_path: PathBuf,
    pub internal_cert_path: PathBuf,
    pub internal_key_path: PathBuf,
    pub log_path: PathBuf,
    pub peers: Vec<PeerConfig>,
    pub ship_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub addr: String,
}

impl ReplicatorConfig {
    pub fn load_from_env() -> AppResult<Self> {
        Ok(Self {
            replica_name: required_env("DISTMAIL_REPLICA_NAME")?,
            listen_addr: env_or("DISTMAIL_REPLICATOR_LISTEN_ADDR", "0.0.0.0:5900"),
            internal_ca_path: required_path_env("DISTMAIL_INTERNAL_CA")?,
            internal_cert_path: required_path_env("DISTMAIL_INTERNAL_CERT")?,
            internal_key_path: required_path_env("DISTMAIL_INTERNAL_KEY")?,
            log_path: required_path_env("DISTMAIL_REPLICATION_LOG")?,
            peers: load_peers()?,
            ship_interval: Duration::from_secs(parse_u64_env("DISTMAIL_SHIP_INTERVAL_SECONDS", 3)?),
        })
    }
}

fn load_auth_backend() -> AppResult<AuthBackendConfig> {
    if let Ok(database_url) = env::var("DISTMAIL_AUTH_DATABASE_URL") {
        return Ok(AuthBackendConfig::Sql { database_url });
    }
    let path = required_path_env("DISTMAIL_AUTH_FILE")?;
    let separator = env_or("DISTMAIL_AUTH_FILE_SEPARATOR", ":");
    let separator = separator
        .chars()
        .next()
        .ok_or_else(|| AppError::config("DISTMAIL_AUTH_FILE_SEPARATOR must be a single character"))?;
    Ok(AuthBackendConfig::File { path, separator })
}

fn load_workers() -> AppResult<Vec<WorkerDescriptor>> {
    let segments = discover_segments("DISTMAIL_WORKER_([A-Z0-9_]+)_PUBLIC_ADDR")?;
    segments.iter().map(|seg| load_worker(seg)).collect()
}

fn load_worker(segment: &str) -> AppResult<WorkerDescriptor> {
    let prefix = format!("DISTMAIL_WORKER_{segment}_");
    Ok(WorkerDescriptor {
        name: env_or(&format!("{prefix}NAME"), &segment.to_ascii_lowercase()),
        public_addr: required_env(&format!("{prefix}PUBLIC_ADDR"))?,
        internal_addr: required_env(&format!("{prefix}INTERNAL_ADDR"))?,
        user_start: parse_u64_env(&format!("{prefix}USER_START"), 0)?,
        user_end: parse_u64_env(&format!("{prefix}USER_END"), 0)?,
        secondary_name: env::var(format!("{prefix}SECONDARY")).ok(),
    })
}

fn load_peers() -> AppResult<Vec<PeerConfig>> {
    let segments = discover_segments("DISTMAIL_PEER_([A-Z0-9_]+)_ADDR")?;
    segments
        .iter()
        .map(|seg| {
            let prefix = format!("DISTMAIL_PEER_{seg}_");
            Ok(PeerConfig {
                name: env_or(&format!("{prefix}NAME"), &seg.to_ascii_lowercase()),
                addr: required_env(&format!("{prefix}ADDR"))?,
            })
        })
        .collect()
}

/// Scan `env::vars()` for every variable matching `pattern` and return the
/// distinct, sorted capture-group segments.
fn discover_segments(pattern: &str) -> AppResult<Vec<String>> {
    let re = Regex::new(pattern).map_err(|e| AppError::config(format!("invalid config regex: {e}")))?;
    let mut segments: Vec<String> = env::vars()
        .filter_map(|(k, _)| re.captures(&k).and_then(|c| c.get(1).map(|m| m.as_str().to_owned())))
        .collect();
    segments.sort();
    segments.dedup();
    Ok(segments)
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Read a required environment variable, returning a config error if
/// missing or empty.
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::config(format!("missing required environment variable {key}"))),
    }
}

fn required_path_env(key: &str) -> AppResult<PathBuf> {
    required_env(key).map(PathBuf::from)
}

/// Parse a `u64` environment variable with a default fallback.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::config(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => {
            Err(AppError::config(format!("environment variable {key} contains non-unicode data")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment-variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_distmail_env() {
        for (key, _) in env::vars() {
            if key.starts_with("DISTMAIL_") {
                unsafe { env::remove_var(key) };
            }
        }
    }

    #[test]
    fn discovers_worker_segments_from_public_addr_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_distmail_env();
        unsafe {
            env::set_var("DISTMAIL_WORKER_W1_PUBLIC_ADDR", "0.0.0.0:1430");
            env::set_var("DISTMAIL_WORKER_W1_INTERNAL_ADDR", "127.0.0.1:5001");
            env::set_var("DISTMAIL_WORKER_W1_USER_START", "1");
            env::set_var("DISTMAIL_WORKER_W1_USER_END", "100");
        }

        let workers = load_workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "w1");
        assert_eq!(workers[0].user_start, 1);
        assert_eq!(workers[0].user_end, 100);
        clear_distmail_env();
    }

    #[test]
    fn missing_required_worker_field_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_distmail_env();
        unsafe {
            env::set_var("DISTMAIL_WORKER_W1_PUBLIC_ADDR", "0.0.0.0:1430");
        }
        assert!(load_workers().is_err());
        clear_distmail_env();
    }

    #[test]
    fn auth_backend_prefers_sql_when_database_url_is_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_distmail_env();
        unsafe {
            env::set_var("DISTMAIL_AUTH_DATABASE_URL", "postgres://localhost/distmail");
        }
        assert!(matches!(load_auth_backend().unwrap(), AuthBackendConfig::Sql { .. }));
        clear_distmail_env();
    }
}
