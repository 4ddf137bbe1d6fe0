//! Connection state for the lifecycle manager.
//!
//! The state is a small three-value machine:
//!
//! ```text
//! Disconnected ──(connect attempt)──> Connecting ──(acknowledged)──> Connected
//!       ▲                                                                │
//!       └───────────────────(connection lost)────────────────────────────┘
//! ```
//!
//! Exactly one instance exists per client, owned by the
//! [`ConnectionManager`](crate::connection::ConnectionManager) and mutated
//! only under its exclusive lock.

use std::fmt;

/// Current state of the managed broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection. This is the initial state and the state entered after
    /// any connection loss.
    #[default]
    Disconnected,

    /// An initial-connect or reconnect attempt is in flight.
    Connecting,

    /// The broker has acknowledged the connection. This is the only state in
    /// which publishes and subscribes can succeed.
    Connected,
}

impl ConnectionState {
    /// Returns a short static identifier for logging and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }

    /// True only in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
