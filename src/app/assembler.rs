//! Wiring of the conversation core.
//!
//! [`assemble`] builds every component from one configuration and one set
//! of external collaborators, and connects their callbacks through weak
//! references so dropping the [`Core`] tears the whole graph down.

use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::domain::{
    epoch_millis, Channel, ConnectionStatus, CoreConfig, CoreError, CoreEvent, DiagnosticLevel,
    DiagnosticSource, Fragment, GenerationCounter, Role, Selection, Turn,
};
use crate::engine::{
    Coordinator, Dispatcher, Lifecycle, Orchestrator, Relay, TranscriptState, UpdateQueue,
};
use crate::ports::{Audience, BackendApi, CaptureDevice, Instructions, OutboundMessage, RealtimeTransport};

const EVENT_CAPACITY: usize = 256;

/// External collaborators of the core.
#[derive(Clone)]
pub struct CoreDeps {
    pub backend: Arc<dyn BackendApi>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub capture: Arc<dyn CaptureDevice>,
}

/// The assembled conversation core.
pub struct Core {
    pub coordinator: Arc<Coordinator>,
    pub orchestrator: Arc<Orchestrator>,
    pub lifecycle: Arc<Lifecycle>,
    pub relay: Arc<Relay>,
    pub dispatcher: Arc<Dispatcher>,
    generation: Arc<GenerationCounter>,
    events: broadcast::Sender<CoreEvent>,
}

/// Build the core from `config` and `deps`.
pub fn assemble(config: &CoreConfig, deps: CoreDeps) -> Core {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let generation = Arc::new(GenerationCounter::new());

    let coordinator = Arc::new(Coordinator::new(
        config.transcript.clone(),
        Arc::clone(&generation),
    ));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&coordinator), events.clone()));
    let relay = Arc::new(Relay::new(
        Arc::clone(&deps.backend),
        &config.relay,
        &config.transcript,
        events.clone(),
    ));
    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&deps.backend),
        Arc::clone(&generation),
        events.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.connection.clone(),
        deps.backend,
        deps.transport,
        deps.capture,
        Arc::clone(&dispatcher),
        events.clone(),
    ));

    // Finalized turns go to the relay for the live session.
    let weak_lifecycle = Arc::downgrade(&lifecycle);
    let weak_relay = Arc::downgrade(&relay);
    coordinator.set_on_finalized(Arc::new(move |turn: Turn| {
        let (Some(lifecycle), Some(relay)) = (weak_lifecycle.upgrade(), weak_relay.upgrade()) else {
            return;
        };
        match lifecycle.session_id() {
            Some(session_id) => {
                relay.persist_turn(&session_id, &turn);
            }
            None => debug!(turn_id = %turn.id, "No session, turn not persisted"),
        }
    }));

    // Selection changes clear the transcript and advance the generation.
    let weak_coordinator = Arc::downgrade(&coordinator);
    let fallback = Arc::clone(&generation);
    lifecycle.set_on_reset(Arc::new(move || match weak_coordinator.upgrade() {
        Some(coordinator) => coordinator.reset(),
        None => fallback.bump(),
    }));

    let weak_coordinator = Arc::downgrade(&coordinator);
    orchestrator.set_tracking_reset(Arc::new(move || {
        if let Some(coordinator) = weak_coordinator.upgrade() {
            coordinator.reset_tracking();
        }
    }));

    // Settled turns reach the relay before the session is ended.
    let weak_coordinator = Arc::downgrade(&coordinator);
    let weak_lifecycle: Weak<Lifecycle> = Arc::downgrade(&lifecycle);
    let weak_relay: Weak<Relay> = Arc::downgrade(&relay);
    orchestrator.set_finalize(Arc::new(move || {
        let coordinator = weak_coordinator.upgrade();
        let lifecycle = weak_lifecycle.upgrade();
        let relay = weak_relay.upgrade();
        async move {
            if let Some(coordinator) = coordinator {
                coordinator.settled().await;
            }
            if let Some(relay) = relay {
                relay.idle().await;
            }
            if let Some(lifecycle) = lifecycle {
                lifecycle.end_session().await;
            }
        }
        .boxed()
    }));

    info!(
        drain_ms = config.connection.drain_ms,
        final_dedup_window_ms = config.transcript.final_dedup_window_ms,
        "Conversation core assembled"
    );

    Core {
        coordinator,
        orchestrator,
        lifecycle,
        relay,
        dispatcher,
        generation,
        events,
    }
}

impl Core {
    /// The update queue the turn log is mutated through.
    pub fn queue(&self) -> &UpdateQueue<TranscriptState> {
        self.coordinator.queue()
    }

    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    /// Status transitions, notices and diagnostics.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Ordered turn-log snapshots.
    pub fn transcript(&self) -> watch::Receiver<Vec<Turn>> {
        self.coordinator.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.orchestrator.status()
    }

    /// Switch counterpart/scenario. The transcript and session are dropped
    /// before this returns control to the runtime.
    pub async fn select(&self, selection: Selection) {
        let previous = self.lifecycle.select(selection);
        if self.orchestrator.status().is_active() {
            self.orchestrator.stop().await;
        }
        if let Some(previous) = previous {
            self.relay.idle().await;
            self.lifecycle.end_detached(previous.session_id).await;
        }
    }

    fn current_selection(&self) -> Result<Selection, CoreError> {
        self.lifecycle
            .selection()
            .ok_or(CoreError::NoSession)
    }

    async fn ensure_session(&self) -> Result<String, CoreError> {
        let selection = self.current_selection()?;
        self.lifecycle
            .ensure_session(&selection.counterpart_id, &selection.scenario_id)
            .await
    }

    /// Make sure a session exists and open the voice connection.
    pub async fn begin_voice(&self) -> Result<u64, CoreError> {
        let session_id = self.ensure_session().await?;
        self.orchestrator.start(&session_id).await
    }

    /// Ensure a session and connect after the short autostart delay.
    pub async fn autostart(&self) -> Result<u64, CoreError> {
        let session_id = self.ensure_session().await?;
        self.orchestrator.autostart(&session_id).await
    }

    /// Record a typed message and forward it to the counterpart if the
    /// transport is up.
    pub async fn send_text(&self, text: &str) -> Result<(), CoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.ensure_session().await?;

        let timestamp = epoch_millis();
        self.relay.note_typed(text, timestamp);
        self.coordinator
            .apply_fragment(Fragment::new(Role::User, Channel::Text, text, true, timestamp));

        if self.orchestrator.status() == ConnectionStatus::Connected {
            if let Err(e) = self.orchestrator.send_text(text) {
                warn!(error = %e, "Typed message not forwarded");
                let _ = self.events.send(CoreEvent::diagnostic(
                    DiagnosticSource::Transport,
                    DiagnosticLevel::Warn,
                    e.to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fetch fresh instructions and hand them to the counterpart.
    pub async fn refresh_instructions(&self) -> Result<Instructions, CoreError> {
        let instructions = self.lifecycle.refresh_instructions(Audience::Counterpart).await?;
        if self.orchestrator.status() == ConnectionStatus::Connected {
            self.orchestrator.send(OutboundMessage::Instructions {
                text: instructions.instructions.clone(),
            })?;
        }
        Ok(instructions)
    }

    /// Stop the transport (or end the session directly when idle) and
    /// return the id the transcript can be exported under.
    pub async fn end_conversation(&self) -> Option<String> {
        if self.orchestrator.status().is_active() {
            self.orchestrator.stop().await;
        } else {
            self.relay.idle().await;
            self.lifecycle.end_session().await;
        }
        self.lifecycle.export_session_id()
    }

    /// Tear the whole core down.
    pub async fn dispose(self) {
        self.end_conversation().await;
        self.relay.idle().await;
        info!("Conversation core disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransportEvent;
    use crate::testing::{FakeBackend, FakeCapture, FakeTransport};
    use std::time::Duration;

    struct Harness {
        core: Core,
        backend: Arc<FakeBackend>,
        transport: Arc<FakeTransport>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let transport = Arc::new(FakeTransport::new());
        let core = assemble(
            &CoreConfig::new(),
            CoreDeps {
                backend: backend.clone(),
                transport: transport.clone(),
                capture: Arc::new(FakeCapture::new(true)),
            },
        );
        Harness {
            core,
            backend,
            transport,
        }
    }

    async fn settle(core: &Core) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        core.coordinator.settled().await;
        core.relay.idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_conversation_end_to_end() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();
        let mut snapshots = core.transcript();

        core.select(Selection::new("pt-7", "knee")).await;
        assert_eq!(core.begin_voice().await.unwrap(), 1);
        assert_eq!(core.status(), ConnectionStatus::Connected);

        let events = transport.last_sender().unwrap();
        events
            .send(TransportEvent::Transcript(
                Fragment::new(Role::Assistant, Channel::Voice, "Where does it hurt?", true, 1_000)
                    .with_item_id("it_1"),
            ))
            .await
            .unwrap();
        settle(&core).await;

        assert!(snapshots.has_changed().unwrap());
        assert_eq!(snapshots.borrow_and_update().len(), 1);
        assert_eq!(backend.persisted_texts(), vec!["Where does it hurt?".to_string()]);
        assert_eq!(backend.persisted()[0].session_id, "session-1");

        core.send_text("  My left knee  ").await.unwrap();
        settle(&core).await;

        let control = transport.last_control().unwrap();
        assert_eq!(
            control.sent(),
            vec![OutboundMessage::UserText {
                text: "My left knee".into()
            }]
        );
        assert!(backend
            .persisted_texts()
            .contains(&"My left knee".to_string()));
        assert_eq!(backend.created().len(), 1);

        assert_eq!(core.end_conversation().await.as_deref(), Some("session-1"));
        assert!(control.is_closed());
        assert_eq!(core.status(), ConnectionStatus::Idle);
        assert_eq!(backend.ended(), vec!["session-1".to_string()]);
        assert!(core.coordinator.export().contains("assistant (voice): Where does it hurt?"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_persists_streaming_turn() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();

        core.select(Selection::new("pt-7", "knee")).await;
        core.begin_voice().await.unwrap();
        transport
            .last_sender()
            .unwrap()
            .send(TransportEvent::Transcript(
                Fragment::new(Role::Assistant, Channel::Voice, "Let me check your", false, 1_000)
                    .with_item_id("it_7"),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        core.coordinator.settled().await;
        assert!(backend.persisted_texts().is_empty());

        assert_eq!(core.end_conversation().await.as_deref(), Some("session-1"));

        assert_eq!(backend.persisted_texts(), vec!["Let me check your".to_string()]);
        assert_eq!(backend.persisted()[0].session_id, "session-1");
        assert_eq!(backend.ended(), vec!["session-1".to_string()]);
        let turns = core.coordinator.turns();
        assert_eq!(turns.len(), 1);
        assert!(!turns[0].pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_text_without_selection_is_rejected() {
        let Harness { core, backend, .. } = harness();

        assert_eq!(core.send_text("hello").await, Err(CoreError::NoSession));
        assert_eq!(core.begin_voice().await, Err(CoreError::NoSession));
        core.send_text("   ").await.unwrap();
        assert!(backend.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_text_while_idle_is_recorded() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();

        core.select(Selection::new("pt-7", "knee")).await;
        core.send_text("I twisted it skiing").await.unwrap();
        settle(&core).await;

        assert!(transport.negotiations().is_empty());
        assert_eq!(core.coordinator.turns().len(), 1);
        assert_eq!(backend.persisted_texts(), vec!["I twisted it skiing".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_change_resets_everything() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();

        core.select(Selection::new("pt-7", "knee")).await;
        core.begin_voice().await.unwrap();
        core.send_text("First case").await.unwrap();
        settle(&core).await;
        let generation = core.generation();

        core.select(Selection::new("pt-9", "chest")).await;
        settle(&core).await;

        assert!(core.generation() > generation);
        assert!(core.coordinator.turns().is_empty());
        assert_eq!(core.status(), ConnectionStatus::Idle);
        assert!(transport.last_control().unwrap().is_closed());
        assert_eq!(backend.ended(), vec!["session-1".to_string()]);
        assert!(core.lifecycle.session_id().is_none());

        // Same selection again is a no-op.
        let generation = core.generation();
        core.select(Selection::new("pt-9", "chest")).await;
        assert_eq!(core.generation(), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_instructions_forwards_to_counterpart() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();

        core.select(Selection::new("pt-7", "knee")).await;
        core.begin_voice().await.unwrap();

        let instructions = core.refresh_instructions().await.unwrap();
        assert_eq!(core.lifecycle.phase().as_deref(), Some("history"));
        assert_eq!(backend.instruction_requests().len(), 1);
        assert_eq!(
            transport.last_control().unwrap().sent(),
            vec![OutboundMessage::Instructions {
                text: instructions.instructions
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_transport_and_ends_session() {
        let Harness {
            core,
            backend,
            transport,
        } = harness();

        core.select(Selection::new("pt-7", "knee")).await;
        core.autostart().await.unwrap();
        assert_eq!(core.status(), ConnectionStatus::Connected);

        core.dispose().await;

        assert!(transport.last_control().unwrap().is_closed());
        assert_eq!(backend.ended(), vec!["session-1".to_string()]);
    }
}
