//! Fire-and-forget persistence of finalized turns.
//!
//! Failures never block the conversation: they raise a short-lived notice
//! and a diagnostic, and are not retried. The backend deduplicates on
//! `(session, role, text, timestamp)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::domain::config::{RelayConfig, TranscriptConfig};
use crate::domain::{
    normalize_text, Channel, CoreEvent, DedupKey, DiagnosticLevel, DiagnosticSource, Notice, Role,
    Turn,
};
use crate::ports::{BackendApi, PersistTurnsRequest, PersistedTurn};

const SENT_KEYS_CAPACITY: usize = 512;

/// Counters kept by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Turns the backend stored.
    pub delivered: u64,
    /// Turns the backend already had.
    pub duplicates: u64,
    pub failed: u64,
    /// Turns never sent (empty, typed echo, already sent).
    pub skipped: u64,
}

/// Transient user-visible notices with automatic expiry.
pub struct NoticeBoard {
    ttl: Duration,
    next_id: AtomicU64,
    active: Mutex<Vec<Notice>>,
    events: broadcast::Sender<CoreEvent>,
}

impl NoticeBoard {
    pub fn new(ttl_ms: u64, events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            ttl: Duration::from_millis(ttl_ms),
            next_id: AtomicU64::new(1),
            active: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Post a notice; it is withdrawn after the configured lifetime.
    pub fn raise(self: &Arc<Self>, message: impl Into<String>) -> Notice {
        let notice = Notice {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            message: message.into(),
            ttl_ms: self.ttl.as_millis() as u64,
        };
        self.active.lock().push(notice.clone());
        let _ = self.events.send(CoreEvent::NoticeRaised(notice.clone()));

        if let Ok(handle) = Handle::try_current() {
            let board = Arc::clone(self);
            let id = notice.id;
            handle.spawn(async move {
                tokio::time::sleep(board.ttl).await;
                board.expire(id);
            });
        }
        notice
    }

    fn expire(&self, id: u64) {
        let removed = {
            let mut active = self.active.lock();
            let before = active.len();
            active.retain(|n| n.id != id);
            active.len() != before
        };
        if removed {
            let _ = self.events.send(CoreEvent::NoticeExpired { id });
        }
    }

    /// Notices currently visible.
    pub fn active(&self) -> Vec<Notice> {
        self.active.lock().clone()
    }
}

#[derive(Debug, Clone)]
struct TypedRecord {
    normalized: String,
    timestamp: u64,
}

pub struct Relay {
    backend: Arc<dyn BackendApi>,
    typed_echo_window_ms: u64,
    dedup_bucket_ms: u64,
    notices: Arc<NoticeBoard>,
    events: broadcast::Sender<CoreEvent>,
    recently_typed: Mutex<Option<TypedRecord>>,
    sent: Mutex<VecDeque<(String, DedupKey)>>,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Relay {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        config: &RelayConfig,
        transcript: &TranscriptConfig,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            backend,
            typed_echo_window_ms: transcript.typed_echo_window_ms,
            dedup_bucket_ms: transcript.final_dedup_window_ms,
            notices: Arc::new(NoticeBoard::new(config.notice_ttl_ms, events.clone())),
            events,
            recently_typed: Mutex::new(None),
            sent: Mutex::new(VecDeque::new()),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Remember what the user just typed so its voice echo is not stored.
    pub fn note_typed(&self, text: &str, timestamp: u64) {
        *self.recently_typed.lock() = Some(TypedRecord {
            normalized: normalize_text(text),
            timestamp,
        });
    }

    /// Persist one finalized utterance. Returns whether a write was issued.
    pub fn persist(
        self: &Arc<Self>,
        session_id: &str,
        role: Role,
        text: &str,
        channel: Channel,
        timestamp: u64,
    ) -> bool {
        let key = DedupKey::content(role, text, timestamp, self.dedup_bucket_ms);
        self.submit(session_id, role, text, channel, timestamp, key)
    }

    /// Persist a finalized turn from the log.
    pub fn persist_turn(self: &Arc<Self>, session_id: &str, turn: &Turn) -> bool {
        let key = match &turn.item_id {
            Some(item) => DedupKey::Item(item.clone()),
            None => DedupKey::content(turn.role, &turn.text, turn.timestamp, self.dedup_bucket_ms),
        };
        self.submit(session_id, turn.role, &turn.text, turn.channel, turn.timestamp, key)
    }

    fn submit(
        self: &Arc<Self>,
        session_id: &str,
        role: Role,
        text: &str,
        channel: Channel,
        timestamp: u64,
        key: DedupKey,
    ) -> bool {
        if text.trim().is_empty() {
            self.skip("empty text");
            return false;
        }
        if role == Role::User && channel == Channel::Voice && self.is_typed_echo(text, timestamp) {
            self.skip("voice echo of typed text");
            return false;
        }
        if !self.mark_sent(session_id, key) {
            self.skip("already sent");
            return false;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime available for persistence");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let request = PersistTurnsRequest {
            session_id: session_id.to_string(),
            turns: vec![PersistedTurn {
                role,
                text: text.trim().to_string(),
                channel,
                timestamp_ms: timestamp,
            }],
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let relay = Arc::clone(self);
        handle.spawn(async move {
            relay.deliver(request).await;
            if relay.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                relay.idle.notify_waiters();
            }
        });
        true
    }

    async fn deliver(&self, request: PersistTurnsRequest) {
        match self.backend.persist_turns(&request).await {
            Ok(report) => {
                self.delivered.fetch_add(report.saved, Ordering::Relaxed);
                self.duplicates.fetch_add(report.duplicates, Ordering::Relaxed);
                info!(
                    session_id = %request.session_id,
                    saved = report.saved,
                    duplicates = report.duplicates,
                    "Turns persisted"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %request.session_id, error = %e, "Turn persistence failed");
                let _ = self.events.send(CoreEvent::diagnostic(
                    DiagnosticSource::Persistence,
                    DiagnosticLevel::Warn,
                    e.to_string(),
                ));
                self.notices
                    .raise("Part of the transcript could not be saved.");
            }
        }
    }

    fn is_typed_echo(&self, text: &str, timestamp: u64) -> bool {
        let normalized = normalize_text(text);
        self.recently_typed.lock().as_ref().is_some_and(|typed| {
            typed.normalized == normalized
                && typed.timestamp.abs_diff(timestamp) < self.typed_echo_window_ms
        })
    }

    fn mark_sent(&self, session_id: &str, key: DedupKey) -> bool {
        let mut sent = self.sent.lock();
        if sent.iter().any(|(s, k)| s == session_id && *k == key) {
            return false;
        }
        if sent.len() == SENT_KEYS_CAPACITY {
            sent.pop_front();
        }
        sent.push_back((session_id.to_string(), key));
        true
    }

    fn skip(&self, reason: &'static str) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "Persistence skipped");
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.active()
    }

    /// Wait for every issued write to complete.
    pub async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
