//! Proxy Router (spec.md §4.5): routes an authenticated session's commands
//! to its owning back-end and handles failover.

pub mod router;

pub use router::{ProxyRouter, ProxySession};
