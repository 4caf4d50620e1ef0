use crate::domain::session::ConnectionStatus;
use thiserror::Error;

/// Errors raised by the conversation core.
///
/// Stale operations are reported as [`CoreError::Superseded`] and are never
/// surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network request blocked: {reason}")]
    NetworkBlocked { reason: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    #[error("No audio capture device available")]
    NoCaptureDevice,

    #[error("Invalid connection state transition from {from:?} ({action})")]
    InvalidTransition {
        from: ConnectionStatus,
        action: &'static str,
    },

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Session creation already in flight")]
    SessionCreationInFlight,

    #[error("No active session")]
    NoSession,

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Operation superseded")]
    Superseded,
}

impl CoreError {
    /// Whether the error should block the user action that caused it.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            CoreError::NoCaptureDevice
                | CoreError::SessionCreation(_)
                | CoreError::ConnectFailed { .. }
        )
    }

    /// Whether the error represents stale work that must be dropped silently.
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        matches!(self, CoreError::Superseded)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
