//! In-memory fakes of the ports, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::CoreError;
use crate::ports::{
    BackendApi, CaptureDevice, ConnectContext, CreateSessionRequest, CreateSessionResponse,
    Instructions, InstructionsRequest, OutboundMessage, PersistReport, PersistTurnsRequest,
    RealtimeTransport, TransportControl, TransportEvent, TransportLink, TransportToken,
    TransportTokenRequest,
};

/// Scriptable conversation backend that records every call.
#[derive(Default)]
pub struct FakeBackend {
    created: Mutex<Vec<CreateSessionRequest>>,
    ended: Mutex<Vec<String>>,
    persisted: Mutex<Vec<PersistTurnsRequest>>,
    instructions: Mutex<Vec<InstructionsRequest>>,
    tokens: Mutex<Vec<TransportTokenRequest>>,
    token_delays: Mutex<VecDeque<u64>>,
    next_session: AtomicU64,
    create_delay_ms: AtomicU64,
    fail_create: AtomicBool,
    fail_persist: AtomicBool,
    phase: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Some("history".to_string())),
            ..Self::default()
        }
    }

    pub fn fail_session_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_persistence(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, ms: u64) {
        self.create_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Delay applied to the next token request; later requests answer
    /// immediately unless more delays are queued.
    pub fn push_token_delay(&self, ms: u64) {
        self.token_delays.lock().push_back(ms);
    }

    pub fn set_phase(&self, phase: Option<&str>) {
        *self.phase.lock() = phase.map(str::to_string);
    }

    pub fn created(&self) -> Vec<CreateSessionRequest> {
        self.created.lock().clone()
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().clone()
    }

    pub fn persisted(&self) -> Vec<PersistTurnsRequest> {
        self.persisted.lock().clone()
    }

    pub fn persisted_texts(&self) -> Vec<String> {
        self.persisted
            .lock()
            .iter()
            .flat_map(|r| r.turns.iter().map(|t| t.text.clone()))
            .collect()
    }

    pub fn token_requests(&self) -> Vec<TransportTokenRequest> {
        self.tokens.lock().clone()
    }

    pub fn instruction_requests(&self) -> Vec<InstructionsRequest> {
        self.instructions.lock().clone()
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, CoreError> {
        self.created.lock().push(request.clone());
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CoreError::Http("HTTP 500 Internal Server Error".to_string()));
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreateSessionResponse {
            session_id: format!("session-{}", n),
            phase: Some("intake".to_string()),
            gate: Some(vec!["consent".to_string()]),
        })
    }

    async fn end_session(&self, session_id: &str) -> Result<(), CoreError> {
        self.ended.lock().push(session_id.to_string());
        Ok(())
    }

    async fn persist_turns(
        &self,
        request: &PersistTurnsRequest,
    ) -> Result<PersistReport, CoreError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(CoreError::Http("HTTP 503 Service Unavailable".to_string()));
        }
        self.persisted.lock().push(request.clone());
        Ok(PersistReport {
            saved: request.turns.len() as u64,
            duplicates: 0,
        })
    }

    async fn fetch_instructions(
        &self,
        request: &InstructionsRequest,
    ) -> Result<Instructions, CoreError> {
        self.instructions.lock().push(request.clone());
        Ok(Instructions {
            instructions: format!("Stay in character for {}", request.session_id),
            phase: self.phase.lock().clone(),
            retrieved_ids: vec!["card-1".to_string()],
        })
    }

    async fn transport_token(
        &self,
        request: &TransportTokenRequest,
    ) -> Result<TransportToken, CoreError> {
        let n = {
            let mut tokens = self.tokens.lock();
            tokens.push(request.clone());
            tokens.len()
        };
        let delay = self.token_delays.lock().pop_front().unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(TransportToken {
            transport_token: format!("tok-{}", n),
            model: "realtime-test".to_string(),
            tts_voice: Some(request.voice.clone()),
            expires_at: None,
        })
    }
}

/// Control handle handed out by [`FakeTransport`].
#[derive(Default)]
pub struct FakeControl {
    input_enabled: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl FakeControl {
    pub fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl TransportControl for FakeControl {
    fn set_input_enabled(&self, enabled: bool) {
        self.input_enabled.store(enabled, Ordering::SeqCst);
    }

    fn send(&self, message: OutboundMessage) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::Transport("data channel closed".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A negotiation the fake transport saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub operation: u64,
    pub attempt: u32,
    pub session_id: String,
    pub token: String,
}

/// Transport whose negotiations succeed unless failures are scripted.
#[derive(Default)]
pub struct FakeTransport {
    failures: Mutex<VecDeque<String>>,
    negotiations: Mutex<Vec<Negotiation>>,
    links: Mutex<Vec<(mpsc::Sender<TransportEvent>, Arc<FakeControl>)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` negotiations fail.
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(message.to_string());
        }
    }

    pub fn negotiations(&self) -> Vec<Negotiation> {
        self.negotiations.lock().clone()
    }

    /// Sender feeding the most recent link.
    pub fn last_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.links.lock().last().map(|(tx, _)| tx.clone())
    }

    pub fn last_control(&self) -> Option<Arc<FakeControl>> {
        self.links.lock().last().map(|(_, control)| Arc::clone(control))
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn negotiate(&self, context: &ConnectContext) -> Result<TransportLink, CoreError> {
        self.negotiations.lock().push(Negotiation {
            operation: context.operation,
            attempt: context.attempt,
            session_id: context.session_id.clone(),
            token: context.token.transport_token.clone(),
        });

        if let Some(message) = self.failures.lock().pop_front() {
            return Err(CoreError::Transport(message));
        }

        let (tx, rx) = mpsc::channel(64);
        let control = Arc::new(FakeControl::default());
        self.links.lock().push((tx, Arc::clone(&control)));
        Ok(TransportLink {
            events: rx,
            control,
        })
    }
}

/// Microphone check with a fixed answer.
pub struct FakeCapture {
    available: AtomicBool,
    checks: AtomicUsize,
}

impl FakeCapture {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCapture {
    fn check_available(&self) -> Result<(), CoreError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::NoCaptureDevice)
        }
    }
}
