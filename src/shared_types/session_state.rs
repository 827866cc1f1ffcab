use std::fmt;

use serde::Serialize;

/// Lifecycle of one tenant's connection.
///
/// ```text
/// Uninitialized -> Pairing -> Connected
/// Connected -> Reconnecting            (retryable close)
/// Reconnecting -> Pairing              (after backoff)
/// Reconnecting -> LoggedOut            (logout / device unlink, terminal)
/// * -> CircuitOpen                     (breaker tripped)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Uninitialized,
    Pairing,
    Connected,
    Reconnecting,
    LoggedOut,
    CircuitOpen,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "UNINITIALIZED",
            SessionState::Pairing => "PAIRING",
            SessionState::Connected => "CONNECTED",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::LoggedOut => "LOGGED_OUT",
            SessionState::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
