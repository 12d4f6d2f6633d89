//! Application error model
//!
//! Defines the error kinds from the error-handling design (client-protocol,
//! client-auth, transport-transient, transport-fatal, state-fatal,
//! config-fatal) and how each is propagated: some become an IMAP reply line,
//! some drive failover, some are fatal to the owning process.

use thiserror::Error;

/// Application error type.
///
/// Each variant corresponds to one row of the error-kind table: client
/// errors become a tagged IMAP reply and the session continues; transport
/// errors drive retry/failover; state and config errors are fatal.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed IMAP line or wrong argument count. Session continues.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Wrong credentials. Session continues in Unauth.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Dial error or RPC `Unavailable`. Caller retries with failover.
    #[error("transport error: {0}")]
    Transport(String),
    /// TLS handshake failure or a non-`Unavailable` RPC status. Session is
    /// terminated.
    #[error("fatal transport error: {0}")]
    TransportFatal(String),
    /// Replication-log I/O failure or non-zero ack after retries. The
    /// replica aborts; no silent degradation.
    #[error("state error: {0}")]
    StateFatal(String),
    /// Misconfiguration: user id outside any worker range, missing
    /// secondary when failover required, bad config file. Refuses to
    /// start or complete LOGIN.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Map a client-facing error to the exact IMAP reply text specified for
    /// it (without the leading tag, which the caller prepends). Returns
    /// `None` for error kinds that never reach the client as text.
    pub fn to_imap_reply(&self) -> Option<&'static str> {
        match self {
            Self::Protocol(_) => Some("BAD Received invalid IMAP command"),
            Self::AuthFailed(_) => Some("NO Name and / or password wrong"),
            Self::Transport(_) => Some("NO internal error"),
            Self::TransportFatal(_) | Self::StateFatal(_) | Self::Config(_) => None,
        }
    }

    /// Whether this error indicates the node/peer should be treated as
    /// unavailable and the caller should fail over (spec.md §4.5, §7).
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Convenience alias for all fallible internal functions.
pub type AppResult<T> = Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
