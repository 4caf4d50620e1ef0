use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::{Channel, CoreError, Role};

/// Request body for session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSessionRequest {
    pub counterpart_id: String,
    pub scenario_id: String,
}

/// Response of session creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub gate: Option<Vec<String>>,
}

/// One finalized turn as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedTurn {
    pub role: Role,
    pub text: String,
    pub channel: Channel,
    pub timestamp_ms: u64,
}

/// Request body for turn persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistTurnsRequest {
    pub session_id: String,
    pub turns: Vec<PersistedTurn>,
}

/// Backend report of a persistence call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct PersistReport {
    #[serde(default)]
    pub saved: u64,
    #[serde(default)]
    pub duplicates: u64,
}

/// Who the instructions are written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Counterpart,
    Learner,
}

/// Request body for instruction retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionsRequest {
    pub session_id: String,
    pub audience: Audience,
}

/// Instructions for the simulated counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Instructions {
    pub instructions: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub retrieved_ids: Vec<String>,
}

/// Request body for a realtime transport token.
///
/// Either a session id or the counterpart/scenario pair identifies the
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub voice: String,
    pub language: String,
}

/// Ephemeral credential for the realtime transport. Zeroed on drop.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TransportToken {
    pub transport_token: String,
    pub model: String,
    #[serde(default)]
    pub tts_voice: Option<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl std::fmt::Debug for TransportToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportToken")
            .field("transport_token", &"<redacted>")
            .field("model", &self.model)
            .field("tts_voice", &self.tts_voice)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Port for the conversation backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Create a backend-tracked session.
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, CoreError>;

    /// End a session. Best-effort.
    async fn end_session(&self, session_id: &str) -> Result<(), CoreError>;

    /// Store finalized turns. The backend deduplicates on
    /// `(session, role, text, timestamp)`.
    async fn persist_turns(&self, request: &PersistTurnsRequest)
        -> Result<PersistReport, CoreError>;

    /// Fetch instructions for the current phase of a session.
    async fn fetch_instructions(
        &self,
        request: &InstructionsRequest,
    ) -> Result<Instructions, CoreError>;

    /// Fetch an ephemeral realtime transport token.
    async fn transport_token(
        &self,
        request: &TransportTokenRequest,
    ) -> Result<TransportToken, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = TransportToken {
            transport_token: "secret-value".into(),
            model: "rt-model".into(),
            tts_voice: None,
            expires_at: Some(10),
        };
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret-value"));
        assert!(printed.contains("rt-model"));
    }

    #[test]
    fn test_token_request_skips_absent_ids() {
        let request = TransportTokenRequest {
            session_id: Some("s1".into()),
            counterpart_id: None,
            scenario_id: None,
            voice: "alloy".into(),
            language: "en".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert!(json.get("counterpart_id").is_none());
    }

    #[test]
    fn test_create_session_response_optional_fields() {
        let response: CreateSessionResponse =
            serde_json::from_str(r#"{"session_id":"abc"}"#).unwrap();
        assert_eq!(response.session_id, "abc");
        assert!(response.phase.is_none());
        assert!(response.gate.is_none());
    }
}
