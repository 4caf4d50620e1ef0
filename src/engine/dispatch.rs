use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::domain::{Channel, CoreEvent, DiagnosticLevel, DiagnosticSource, Fragment, Role};
use crate::engine::coordinator::Coordinator;
use crate::ports::TransportEvent;

/// Whether the event pump should keep reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Closed(Option<String>),
}

/// Routes transport events to the rest of the core.
pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    events: broadcast::Sender<CoreEvent>,
    audio_frames: AtomicU64,
    audio_bytes: AtomicU64,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<Coordinator>, events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            coordinator,
            events,
            audio_frames: AtomicU64::new(0),
            audio_bytes: AtomicU64::new(0),
        }
    }

    /// Generation transcript fragments are stamped with.
    pub fn generation(&self) -> u64 {
        self.coordinator.queue().generation()
    }

    /// Handle one event captured under `generation`.
    pub fn dispatch(&self, generation: u64, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Audio { bytes } => {
                self.audio_frames.fetch_add(1, Ordering::Relaxed);
                self.audio_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                Flow::Continue
            }
            TransportEvent::Transcript(fragment) => {
                trace!(
                    role = %fragment.role,
                    channel = %fragment.channel,
                    is_final = fragment.is_final,
                    timestamp = fragment.timestamp,
                    "Transcript fragment"
                );
                self.coordinator.apply_fragment_at(generation, fragment);
                Flow::Continue
            }
            TransportEvent::SpeechStarted { timestamp } => {
                // Opens the partial tracker so the turn is stamped at speech start.
                self.coordinator.apply_fragment_at(
                    generation,
                    Fragment::new(Role::User, Channel::Voice, "", false, timestamp),
                );
                Flow::Continue
            }
            TransportEvent::Error { message } => {
                warn!(error = %message, "Transport reported an error");
                let _ = self.events.send(CoreEvent::diagnostic(
                    DiagnosticSource::Transport,
                    DiagnosticLevel::Warn,
                    message,
                ));
                Flow::Continue
            }
            TransportEvent::Closed { reason } => {
                debug!(reason = ?reason, "Transport closed");
                Flow::Closed(reason)
            }
        }
    }

    /// Inbound audio frames seen so far.
    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes.load(Ordering::Relaxed)
    }
}
