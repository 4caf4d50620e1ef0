//! Generation-stamped mutation batching.
//!
//! Mutations are appended to a batch and applied by a single scheduled flush
//! task, in enqueue order, while the target is locked. A mutation whose
//! generation is no longer current at flush time is skipped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::domain::GenerationCounter;

type Mutation<S> = Box<dyn FnOnce(&mut S) + Send>;
type FlushHook<S> = Box<dyn Fn(&S) + Send + Sync>;

struct Batch<S> {
    entries: Vec<(u64, Mutation<S>)>,
    flush_scheduled: bool,
}

struct Inner<S> {
    generation: Arc<GenerationCounter>,
    target: Arc<Mutex<S>>,
    batch: Mutex<Batch<S>>,
    on_flush: Mutex<Option<FlushHook<S>>>,
    idle: Notify,
}

/// Counts reported by one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub applied: usize,
    pub skipped: usize,
}

impl<S: Send + 'static> Inner<S> {
    fn drain(&self) -> FlushStats {
        let mut stats = FlushStats::default();
        loop {
            // Target before batch, so overlapping drains apply in take order.
            let mut target = self.target.lock();
            let entries = {
                let mut batch = self.batch.lock();
                if batch.entries.is_empty() {
                    batch.flush_scheduled = false;
                    break;
                }
                std::mem::take(&mut batch.entries)
            };

            let mut applied = 0;
            for (generation, mutation) in entries {
                if self.generation.is_current(generation) {
                    mutation(&mut *target);
                    applied += 1;
                } else {
                    stats.skipped += 1;
                }
            }
            if applied > 0 {
                if let Some(hook) = self.on_flush.lock().as_ref() {
                    hook(&*target);
                }
            }
            stats.applied += applied;
        }

        if stats.skipped > 0 {
            debug!(skipped = stats.skipped, "Discarded stale queued mutations");
        }
        trace!(applied = stats.applied, "Update queue flushed");
        self.idle.notify_waiters();
        stats
    }
}

/// Ordered, generation-aware mutation queue for a single owned target.
pub struct UpdateQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for UpdateQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> UpdateQueue<S> {
    pub fn new(generation: Arc<GenerationCounter>, target: Arc<Mutex<S>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                generation,
                target,
                batch: Mutex::new(Batch {
                    entries: Vec::new(),
                    flush_scheduled: false,
                }),
                on_flush: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    /// Install a hook called with the target after every flush that applied
    /// at least one mutation.
    pub fn set_on_flush(&self, hook: impl Fn(&S) + Send + Sync + 'static) {
        *self.inner.on_flush.lock() = Some(Box::new(hook));
    }

    /// Live generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.current()
    }

    /// Append a mutation stamped with `generation`.
    ///
    /// Schedules a flush task on the current tokio runtime if none is
    /// pending. Without a runtime the batch is drained inline.
    pub fn enqueue(&self, generation: u64, mutation: impl FnOnce(&mut S) + Send + 'static) {
        let schedule = {
            let mut batch = self.inner.batch.lock();
            batch.entries.push((generation, Box::new(mutation)));
            let schedule = !batch.flush_scheduled;
            batch.flush_scheduled = true;
            schedule
        };

        if !schedule {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    inner.drain();
                });
            }
            Err(_) => {
                self.inner.drain();
            }
        }
    }

    /// Enqueue at the live generation.
    pub fn enqueue_current(&self, mutation: impl FnOnce(&mut S) + Send + 'static) {
        self.enqueue(self.generation(), mutation);
    }

    /// Bump the generation and discard everything not yet applied.
    /// Returns the new generation.
    pub fn reset(&self) -> u64 {
        let discarded = {
            let mut batch = self.inner.batch.lock();
            let discarded = batch.entries.len();
            batch.entries.clear();
            batch.flush_scheduled = false;
            discarded
        };
        let generation = self.inner.generation.bump();
        debug!(generation, discarded, "Update queue reset");
        self.inner.idle.notify_waiters();
        generation
    }

    /// Drain the pending batch on the calling thread.
    pub fn flush_now(&self) -> FlushStats {
        self.inner.drain()
    }

    /// Number of mutations waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.inner.batch.lock().entries.len()
    }

    /// Wait until no flush is pending.
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let batch = self.inner.batch.lock();
                if batch.entries.is_empty() && !batch.flush_scheduled {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Read the target outside of a flush.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&*self.inner.target.lock())
    }
}
