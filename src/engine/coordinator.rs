use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::config::TranscriptConfig;
use crate::domain::{Fragment, GenerationCounter, Turn};
use crate::engine::transcript::TranscriptState;
use crate::engine::update_queue::UpdateQueue;

/// Receives every turn that became final.
pub type FinalizedHook = Arc<dyn Fn(Turn) + Send + Sync>;

/// Owner of the turn log.
///
/// All mutation goes through the update queue; readers get copies or
/// subscribe to snapshots.
pub struct Coordinator {
    queue: UpdateQueue<TranscriptState>,
    snapshots: watch::Sender<Vec<Turn>>,
    on_finalized: Arc<RwLock<Option<FinalizedHook>>>,
}

impl Coordinator {
    pub fn new(config: TranscriptConfig, generation: Arc<GenerationCounter>) -> Self {
        let state = Arc::new(Mutex::new(TranscriptState::new(config)));
        let queue = UpdateQueue::new(generation, state);
        let (snapshots, _) = watch::channel(Vec::new());

        let publisher = snapshots.clone();
        queue.set_on_flush(move |state: &TranscriptState| {
            publisher.send_if_modified(|current| {
                if current.as_slice() == state.turns() {
                    false
                } else {
                    *current = state.turns().to_vec();
                    true
                }
            });
        });

        Self {
            queue,
            snapshots,
            on_finalized: Arc::new(RwLock::new(None)),
        }
    }

    /// The queue the log is mutated through.
    pub fn queue(&self) -> &UpdateQueue<TranscriptState> {
        &self.queue
    }

    pub fn set_on_finalized(&self, hook: FinalizedHook) {
        *self.on_finalized.write() = Some(hook);
    }

    /// Apply a fragment at the live generation.
    pub fn apply_fragment(&self, fragment: Fragment) {
        self.apply_fragment_at(self.queue.generation(), fragment);
    }

    /// Apply a fragment captured under `generation`; it is dropped if the
    /// generation has advanced by the time the batch flushes.
    pub fn apply_fragment_at(&self, generation: u64, fragment: Fragment) {
        let hook = Arc::clone(&self.on_finalized);
        self.queue.enqueue(generation, move |state| {
            let outcome = state.apply(fragment);
            if let Some(turn) = outcome.finalized {
                notify_finalized(&hook, turn);
            }
        });
    }

    /// Forget cursors and dedup records at a connection boundary. The log is
    /// kept; interim turns are settled.
    pub fn reset_tracking(&self) {
        let hook = Arc::clone(&self.on_finalized);
        self.queue.enqueue_current(move |state| {
            let settled = state.reset_tracking();
            debug!(settled = settled.len(), "Transcript tracking reset");
            for turn in settled {
                notify_finalized(&hook, turn);
            }
        });
    }

    /// Discard all queued work and clear the log. Returns the new
    /// generation.
    pub fn reset(&self) -> u64 {
        let generation = self.queue.reset();
        self.queue.enqueue(generation, |state| state.clear());
        info!(generation, "Transcript reset");
        generation
    }

    /// Copy of the ordered turn log.
    pub fn turns(&self) -> Vec<Turn> {
        self.queue.read(|state| state.turns().to_vec())
    }

    /// Subscribe to ordered snapshots published after each flush.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Turn>> {
        self.snapshots.subscribe()
    }

    /// Wait for queued mutations to land.
    pub async fn settled(&self) {
        self.queue.settled().await;
    }

    /// Plain-text transcript of the finalized turns.
    pub fn export(&self) -> String {
        self.turns()
            .iter()
            .filter(|t| !t.pending)
            .map(|t| format!("{} ({}): {}", t.role, t.channel, t.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn notify_finalized(hook: &RwLock<Option<FinalizedHook>>, turn: Turn) {
    if let Some(hook) = hook.read().as_ref() {
        hook(turn);
    }
}
