use serde::Serialize;

use crate::domain::session::ConnectionStatus;

/// Which component produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    Transport,
    Capture,
    Session,
    Persistence,
    Transcript,
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

/// A user-visible notice that disappears on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub id: u64,
    pub message: String,
    pub ttl_ms: u64,
}

/// Events emitted by the conversation core to outer collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum CoreEvent {
    /// Connection status changed.
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
        operation: u64,
    },
    /// Microphone input was paused or resumed.
    InputPaused { paused: bool },
    /// A session became active.
    SessionStarted { session_id: String },
    /// A session was ended.
    SessionEnded { session_id: String },
    /// Phase reported by the backend changed.
    PhaseChanged { phase: Option<String> },
    /// A transient notice was raised.
    NoticeRaised(Notice),
    /// A transient notice expired.
    NoticeExpired { id: u64 },
    /// Out-of-band diagnostic, emitted for every failure.
    Diagnostic {
        source: DiagnosticSource,
        level: DiagnosticLevel,
        message: String,
    },
}

impl CoreEvent {
    pub fn diagnostic(
        source: DiagnosticSource,
        level: DiagnosticLevel,
        message: impl Into<String>,
    ) -> Self {
        CoreEvent::Diagnostic {
            source,
            level,
            message: message.into(),
        }
    }
}
