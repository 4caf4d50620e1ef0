use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::domain::CoreError;
use crate::ports::{
    BackendApi, CreateSessionRequest, CreateSessionResponse, HttpClient, Instructions,
    InstructionsRequest, PersistReport, PersistTurnsRequest, TransportToken,
    TransportTokenRequest,
};

#[derive(Serialize)]
struct EndSessionRequest<'a> {
    session_id: &'a str,
}

/// Conversation backend reached over JSON/HTTP.
pub struct HttpBackend<C> {
    client: Arc<C>,
    base_url: String,
}

impl<C: HttpClient> HttpBackend<C> {
    pub fn new(client: Arc<C>, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl<C: HttpClient + 'static> BackendApi for HttpBackend<C> {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, CoreError> {
        debug!(counterpart_id = %request.counterpart_id, scenario_id = %request.scenario_id, "POST /sessions");
        self.client.post_json(&self.url("/sessions"), request).await
    }

    async fn end_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.client
            .post_ack(
                &self.url(&format!("/sessions/{}/end", session_id)),
                &EndSessionRequest { session_id },
            )
            .await
    }

    async fn persist_turns(
        &self,
        request: &PersistTurnsRequest,
    ) -> Result<PersistReport, CoreError> {
        self.client
            .post_json(
                &self.url(&format!("/sessions/{}/turns", request.session_id)),
                request,
            )
            .await
            .map_err(|e| match e {
                CoreError::Http(msg) => CoreError::Persistence(msg),
                other => other,
            })
    }

    async fn fetch_instructions(
        &self,
        request: &InstructionsRequest,
    ) -> Result<Instructions, CoreError> {
        self.client
            .post_json(
                &self.url(&format!("/sessions/{}/instructions", request.session_id)),
                request,
            )
            .await
    }

    async fn transport_token(
        &self,
        request: &TransportTokenRequest,
    ) -> Result<TransportToken, CoreError> {
        self.client
            .post_json(&self.url("/realtime/token"), request)
            .await
            .map_err(|e| match e {
                CoreError::Http(msg) => CoreError::Transport(format!("token request failed: {}", msg)),
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GuardedHttpClient;
    use crate::domain::config::BackendConfig;
    use crate::domain::{Channel, Role};
    use crate::ports::{Audience, PersistedTurn};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> HttpBackend<GuardedHttpClient> {
        let config = BackendConfig {
            base_url: format!("{}/", server.uri()),
            ..BackendConfig::default()
        };
        let client = Arc::new(GuardedHttpClient::new(&config).unwrap());
        HttpBackend::new(client, &config.base_url)
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .and(body_json(json!({"counterpart_id": "pt-7", "scenario_id": "knee"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"session_id": "s-42", "phase": "intake", "gate": ["consent"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = backend(&server)
            .await
            .create_session(&CreateSessionRequest {
                counterpart_id: "pt-7".into(),
                scenario_id: "knee".into(),
            })
            .await
            .unwrap();
        assert_eq!(response.session_id, "s-42");
        assert_eq!(response.gate, Some(vec!["consent".to_string()]));
    }

    #[tokio::test]
    async fn test_persist_turns_posts_to_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-42/turns"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"saved": 1, "duplicates": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let report = backend(&server)
            .await
            .persist_turns(&PersistTurnsRequest {
                session_id: "s-42".into(),
                turns: vec![PersistedTurn {
                    role: Role::User,
                    text: "My knee hurts".into(),
                    channel: Channel::Voice,
                    timestamp_ms: 1_000,
                }],
            })
            .await
            .unwrap();
        assert_eq!(report, PersistReport { saved: 1, duplicates: 0 });
    }

    #[tokio::test]
    async fn test_persist_failure_maps_to_persistence_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .persist_turns(&PersistTurnsRequest {
                session_id: "s-42".into(),
                turns: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert!(!err.is_blocking());
    }

    #[tokio::test]
    async fn test_end_session_acknowledged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-42/end"))
            .and(body_json(json!({"session_id": "s-42"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server).await.end_session("s-42").await.unwrap();
    }

    #[tokio::test]
    async fn test_instructions_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-42/instructions"))
            .and(body_json(json!({"session_id": "s-42", "audience": "counterpart"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instructions": "You are a patient with knee pain.",
                "phase": "history",
                "retrieved_ids": ["card-3"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/realtime/token"))
            .and(body_json(json!({"session_id": "s-42", "voice": "alloy", "language": "en"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transport_token": "ek_123",
                "model": "realtime-1",
                "tts_voice": "alloy",
                "expires_at": 1700000000
            })))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        let instructions = backend
            .fetch_instructions(&InstructionsRequest {
                session_id: "s-42".into(),
                audience: Audience::Counterpart,
            })
            .await
            .unwrap();
        assert_eq!(instructions.phase.as_deref(), Some("history"));
        assert_eq!(instructions.retrieved_ids, vec!["card-3".to_string()]);

        let token = backend
            .transport_token(&TransportTokenRequest {
                session_id: Some("s-42".into()),
                counterpart_id: None,
                scenario_id: None,
                voice: "alloy".into(),
                language: "en".into(),
            })
            .await
            .unwrap();
        assert_eq!(token.transport_token, "ek_123");
        assert_eq!(token.expires_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_token_failure_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime/token"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .transport_token(&TransportTokenRequest {
                session_id: Some("s-42".into()),
                counterpart_id: None,
                scenario_id: None,
                voice: "alloy".into(),
                language: "en".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }
}
