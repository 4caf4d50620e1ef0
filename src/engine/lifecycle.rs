//! Backend session lifecycle.
//!
//! Sessions are created lazily on the first real user action. Creation is
//! single-flight: a second caller while one is in progress is turned away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{
    CoreError, CoreEvent, DiagnosticLevel, DiagnosticSource, GenerationCounter, Selection,
    SessionInfo,
};
use crate::ports::{Audience, BackendApi, CreateSessionRequest, Instructions, InstructionsRequest};

/// Resets everything scoped to the old selection and returns the new
/// generation.
pub type SelectionResetHook = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Default)]
struct SessionState {
    selection: Option<Selection>,
    session: Option<SessionInfo>,
    ended_session_id: Option<String>,
}

/// Clears the in-flight flag even if the creating future is dropped.
struct CreationGuard<'a>(&'a AtomicBool);

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Lifecycle {
    backend: Arc<dyn BackendApi>,
    generation: Arc<GenerationCounter>,
    events: broadcast::Sender<CoreEvent>,
    state: Mutex<SessionState>,
    creating: AtomicBool,
    on_reset: RwLock<Option<SelectionResetHook>>,
}

impl Lifecycle {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        generation: Arc<GenerationCounter>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            backend,
            generation,
            events,
            state: Mutex::new(SessionState::default()),
            creating: AtomicBool::new(false),
            on_reset: RwLock::new(None),
        }
    }

    /// Install the reset run on selection change. Without one the
    /// generation is bumped directly.
    pub fn set_on_reset(&self, hook: SelectionResetHook) {
        *self.on_reset.write() = Some(hook);
    }

    pub fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.state.lock().session.clone()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.state.lock().selection.clone()
    }

    pub fn phase(&self) -> Option<String> {
        self.state.lock().session.as_ref().and_then(|s| s.phase.clone())
    }

    /// Live session id, or the last ended one.
    pub fn export_session_id(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .or_else(|| state.ended_session_id.clone())
    }

    pub fn is_creating(&self) -> bool {
        self.creating.load(Ordering::Acquire)
    }

    /// Switch to a new counterpart/scenario.
    ///
    /// Synchronously drops the session, resets phase and gate, and advances
    /// the generation. Returns the session that was live, which the caller
    /// ends.
    pub fn select(&self, selection: Selection) -> Option<SessionInfo> {
        let previous = {
            let mut state = self.state.lock();
            if state.selection.as_ref() == Some(&selection) {
                return None;
            }
            state.selection = Some(selection.clone());
            state.session.take()
        };

        let hook = self.on_reset.read().clone();
        let generation = match hook {
            Some(reset) => reset(),
            None => self.generation.bump(),
        };

        info!(
            counterpart_id = %selection.counterpart_id,
            scenario_id = %selection.scenario_id,
            generation,
            "Selection changed"
        );
        let _ = self.events.send(CoreEvent::PhaseChanged { phase: None });
        previous
    }

    /// Return the live session for this selection, creating it if needed.
    pub async fn ensure_session(
        &self,
        counterpart_id: &str,
        scenario_id: &str,
    ) -> Result<String, CoreError> {
        let selection = Selection::new(counterpart_id, scenario_id);
        let replaced = self.select(selection.clone());
        if let Some(replaced) = replaced {
            self.end_detached(replaced.session_id).await;
        }

        if let Some(id) = self.session_id() {
            return Ok(id);
        }

        if self
            .creating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(counterpart_id, scenario_id, "Session creation already in flight, rejecting");
            return Err(CoreError::SessionCreationInFlight);
        }
        let _guard = CreationGuard(&self.creating);

        let generation = self.generation.current();
        let request = CreateSessionRequest {
            counterpart_id: selection.counterpart_id.clone(),
            scenario_id: selection.scenario_id.clone(),
        };
        debug!(counterpart_id, scenario_id, generation, "Creating session");

        let response = match self.backend.create_session(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Session creation failed");
                let _ = self.events.send(CoreEvent::diagnostic(
                    DiagnosticSource::Session,
                    DiagnosticLevel::Error,
                    e.to_string(),
                ));
                return Err(CoreError::SessionCreation(e.to_string()));
            }
        };

        if !self.generation.is_current(generation) {
            warn!(session_id = %response.session_id, "Selection changed during session creation, discarding");
            self.end_detached(response.session_id).await;
            return Err(CoreError::Superseded);
        }

        let info = SessionInfo {
            session_id: response.session_id,
            phase: response.phase,
            gate: response.gate.unwrap_or_default(),
        };
        {
            let mut state = self.state.lock();
            state.session = Some(info.clone());
            state.ended_session_id = None;
        }

        info!(session_id = %info.session_id, phase = ?info.phase, gate = ?info.gate, "Session created");
        let _ = self.events.send(CoreEvent::SessionStarted {
            session_id: info.session_id.clone(),
        });
        let _ = self.events.send(CoreEvent::PhaseChanged {
            phase: info.phase.clone(),
        });
        Ok(info.session_id)
    }

    /// End the live session. The id stays available for export.
    pub async fn end_session(&self) -> Option<String> {
        let session = {
            let mut state = self.state.lock();
            let session = state.session.take()?;
            state.ended_session_id = Some(session.session_id.clone());
            session
        };
        self.end_detached(session.session_id.clone()).await;
        Some(session.session_id)
    }

    /// End a session that is no longer tracked. Failures are reported, not returned.
    pub async fn end_detached(&self, session_id: String) {
        match self.backend.end_session(&session_id).await {
            Ok(()) => info!(session_id = %session_id, "Session ended"),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Ending session failed");
                let _ = self.events.send(CoreEvent::diagnostic(
                    DiagnosticSource::Session,
                    DiagnosticLevel::Warn,
                    e.to_string(),
                ));
            }
        }
        let _ = self.events.send(CoreEvent::SessionEnded { session_id });
    }

    /// Fetch instructions for the live session and record its phase.
    pub async fn refresh_instructions(&self, audience: Audience) -> Result<Instructions, CoreError> {
        let session_id = self.session_id().ok_or(CoreError::NoSession)?;
        let generation = self.generation.current();

        let instructions = self
            .backend
            .fetch_instructions(&InstructionsRequest {
                session_id: session_id.clone(),
                audience,
            })
            .await?;

        if !self.generation.is_current(generation) {
            return Err(CoreError::Superseded);
        }

        let changed = {
            let mut state = self.state.lock();
            match state.session.as_mut() {
                Some(session) if session.session_id == session_id => {
                    if instructions.phase.is_some() && session.phase != instructions.phase {
                        session.phase = instructions.phase.clone();
                        true
                    } else {
                        false
                    }
                }
                _ => return Err(CoreError::Superseded),
            }
        };
        if changed {
            info!(session_id = %session_id, phase = ?instructions.phase, "Phase changed");
            let _ = self.events.send(CoreEvent::PhaseChanged {
                phase: instructions.phase.clone(),
            });
        }
        debug!(retrieved = instructions.retrieved_ids.len(), "Instructions refreshed");
        Ok(instructions)
    }
}
