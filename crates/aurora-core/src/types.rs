//! Core types shared by the server runtime crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a server instance.
///
/// Transitions are monotonic: `Uninitialized -> Initialized -> Running ->
/// Stopped`. Only test harnesses move a stopped server back to
/// `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    /// Constructed, nothing allocated yet
    Uninitialized,
    /// Config validated, connector and thread pool built
    Initialized,
    /// Listening socket bound and accepting connections
    Running,
    /// Shut down; all resources released
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Uninitialized => write!(f, "UNINITIALIZED"),
            ServerState::Initialized => write!(f, "INITIALIZED"),
            ServerState::Running => write!(f, "RUNNING"),
            ServerState::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl ServerState {
    /// Returns true while the server owns a bound listening socket.
    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    /// Returns true once the server holds resources that `stop` must release.
    pub fn holds_resources(&self) -> bool {
        matches!(self, ServerState::Initialized | ServerState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ServerState::Uninitialized.to_string(), "UNINITIALIZED");
        assert_eq!(ServerState::Stopped.to_string(), "STOPPED");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ServerState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ServerState::Running.is_running());
        assert!(ServerState::Initialized.holds_resources());
        assert!(!ServerState::Stopped.holds_resources());
    }
}
