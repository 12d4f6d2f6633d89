//! Public IMAP surface: line framing (spec.md §4.3) and the per-connection
//! state machine (spec.md §4.4).

pub mod connection;
pub mod session;

pub use connection::FramedConnection;
pub use session::SessionContext;
