//! Turn log reconciliation.
//!
//! [`TranscriptState`] merges fragments from the voice and text channels into
//! one ordered, duplicate-free list of [`Turn`]s. It is purely synchronous;
//! the [`Coordinator`](super::coordinator::Coordinator) owns it and only
//! mutates it inside update-queue flushes.
//!
//! Fragments carry the full text of the utterance so far, not deltas.
//!
//! Order of checks for every fragment:
//! 1. user voice interims only feed the partial tracker (no turn yet)
//! 2. voice fragments fold into a recent same-role text turn
//! 3. finals repeating the role's last final inside the window are dropped
//! 4. user voice finals echoing recently typed text are dropped
//! 5. the lane's streaming turn is updated, or a new turn is created
//! 6. finals clear the cursor and update the dedup records

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::domain::config::TranscriptConfig;
use crate::domain::{normalize_text, Channel, Fragment, Lane, LaneTable, Role, RoleTable, Turn};

const FINALIZED_ITEMS_CAPACITY: usize = 256;

/// Normalized text plus the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TextRecord {
    normalized: String,
    timestamp: u64,
}

impl TextRecord {
    fn matches(&self, normalized: &str, timestamp: u64, window_ms: u64) -> bool {
        !normalized.is_empty()
            && self.normalized == normalized
            && self.timestamp.abs_diff(timestamp) < window_ms
    }
}

/// User speech the recognizer is still revising.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartialUtterance {
    text: String,
    started_at: u64,
    item_id: Option<String>,
}

/// What applying a fragment did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// User speech tracked without a visible turn.
    Partial,
    Created,
    Updated,
    /// Voice fragment routed into a same-role text turn.
    Folded,
    /// Re-delivery of an already finalized utterance.
    Duplicate,
    /// Voice echo of what the user just typed.
    TypedEcho,
    /// Nothing to show (empty text with no target turn).
    Ignored,
}

impl Change {
    /// Whether the visible log may have changed.
    pub fn touches_log(&self) -> bool {
        !matches!(self, Change::Partial | Change::Ignored)
    }
}

/// Result of [`TranscriptState::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub change: Change,
    pub turn_id: Option<String>,
    /// The turn that became final with this fragment, if any.
    pub finalized: Option<Turn>,
}

impl Outcome {
    fn bare(change: Change) -> Self {
        Self {
            change,
            turn_id: None,
            finalized: None,
        }
    }
}

/// The turn log and every piece of tracking state used to build it.
#[derive(Debug, Clone)]
pub struct TranscriptState {
    config: TranscriptConfig,
    turns: Vec<Turn>,
    cursors: LaneTable<Option<String>>,
    last_final: RoleTable<Option<TextRecord>>,
    recently_typed: Option<TextRecord>,
    partial: Option<PartialUtterance>,
    finalized_items: VecDeque<String>,
    next_sequence: u64,
}

impl TranscriptState {
    pub fn new(config: TranscriptConfig) -> Self {
        Self {
            config,
            turns: Vec::new(),
            cursors: LaneTable::default(),
            last_final: RoleTable::default(),
            recently_typed: None,
            partial: None,
            finalized_items: VecDeque::new(),
            next_sequence: 1,
        }
    }

    /// Ordered turn log.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Id of the in-flight turn for a lane.
    pub fn cursor(&self, lane: Lane) -> Option<&str> {
        self.cursors.get(lane).as_deref()
    }

    /// Latest non-empty recognizer text for the user's current utterance.
    pub fn partial_text(&self) -> Option<&str> {
        self.partial.as_ref().map(|p| p.text.as_str())
    }

    pub fn apply(&mut self, fragment: Fragment) -> Outcome {
        let lane = fragment.lane();

        if lane == Lane::UserVoice && !fragment.is_final {
            self.track_partial(&fragment);
            return Outcome::bare(Change::Partial);
        }

        if fragment.channel == Channel::Voice {
            if let Some(index) = self.fold_target(fragment.role, fragment.timestamp) {
                return self.fold_into(index, &fragment);
            }
        }

        let text = self.effective_text(&fragment);

        if fragment.is_final {
            let normalized = normalize_text(&text);

            if self.is_duplicate_final(&fragment, &normalized) {
                debug!(role = %fragment.role, channel = %fragment.channel, timestamp = fragment.timestamp, "Dropping duplicate final");
                self.discard_lane(lane);
                return Outcome::bare(Change::Duplicate);
            }

            if lane == Lane::UserVoice && self.is_typed_echo(&normalized, fragment.timestamp) {
                debug!(timestamp = fragment.timestamp, "Dropping voice echo of typed text");
                self.discard_lane(lane);
                return Outcome::bare(Change::TypedEcho);
            }
        }

        let (change, index) = match self.cursor_index(lane) {
            Some(index) => {
                let turn = &mut self.turns[index];
                if !fragment.text.trim().is_empty() {
                    turn.text = fragment.text.clone();
                }
                if turn.item_id.is_none() {
                    turn.item_id = fragment.item_id.clone();
                }
                if fragment.is_final {
                    turn.pending = false;
                }
                (Change::Updated, index)
            }
            None => {
                if text.trim().is_empty() {
                    if fragment.is_final && lane == Lane::UserVoice {
                        self.partial = None;
                    }
                    return Outcome::bare(Change::Ignored);
                }
                let index = self.create_turn(&fragment, text);
                (Change::Created, index)
            }
        };

        let turn_id = self.turns[index].id.clone();
        let finalized = if fragment.is_final {
            Some(self.finalize(index, fragment.timestamp))
        } else {
            *self.cursors.get_mut(lane) = Some(turn_id.clone());
            None
        };
        self.sort();

        trace!(turn_id = %turn_id, ?change, "Fragment applied");
        Outcome {
            change,
            turn_id: Some(turn_id),
            finalized,
        }
    }

    /// Drop cursors, dedup records and the partial tracker. Interim turns
    /// left behind are settled in place and returned if they carry text.
    pub fn reset_tracking(&mut self) -> Vec<Turn> {
        self.cursors.clear();
        self.last_final.clear();
        self.recently_typed = None;
        self.partial = None;
        self.finalized_items.clear();

        let mut settled = Vec::new();
        for turn in self.turns.iter_mut().filter(|t| t.pending) {
            turn.pending = false;
            if !turn.text.trim().is_empty() {
                settled.push(turn.clone());
            }
        }
        settled
    }

    /// Forget the whole log. Sequence numbers keep increasing so turn ids
    /// stay unique.
    pub fn clear(&mut self) {
        self.reset_tracking();
        self.turns.clear();
    }

    fn track_partial(&mut self, fragment: &Fragment) {
        match &mut self.partial {
            Some(partial) => {
                if !fragment.text.trim().is_empty() {
                    partial.text = fragment.text.clone();
                }
                if partial.item_id.is_none() {
                    partial.item_id = fragment.item_id.clone();
                }
            }
            None => {
                self.partial = Some(PartialUtterance {
                    text: fragment.text.clone(),
                    started_at: fragment.timestamp,
                    item_id: fragment.item_id.clone(),
                });
            }
        }
    }

    /// Most recent same-role text turn started within the fold window.
    fn fold_target(&self, role: Role, timestamp: u64) -> Option<usize> {
        let window = self.config.cross_channel_fold_ms;
        self.turns
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.role == role
                    && t.channel == Channel::Text
                    && t.timestamp.abs_diff(timestamp) <= window
            })
            .max_by_key(|(_, t)| t.sequence)
            .map(|(index, _)| index)
    }

    fn fold_into(&mut self, index: usize, fragment: &Fragment) -> Outcome {
        let voice_lane = fragment.lane();
        let target_sequence = self.turns[index].sequence;
        if voice_lane == Lane::UserVoice {
            self.partial = None;
        }
        // A streaming voice turn for the same utterance is now represented by
        // the text turn.
        if let Some(voice_turn) = self.cursors.get_mut(voice_lane).take() {
            self.turns.retain(|t| t.id != voice_turn);
        }
        let index = self
            .turns
            .iter()
            .position(|t| t.sequence == target_sequence)
            .unwrap_or(index);

        let turn = &mut self.turns[index];
        let turn_id = turn.id.clone();
        let mut finalized = None;

        if turn.pending {
            let has_text = !fragment.text.trim().is_empty();
            if has_text && (fragment.is_final || turn.text.trim().is_empty()) {
                turn.text = fragment.text.clone();
            }
            if fragment.is_final {
                finalized = Some(self.finalize(index, fragment.timestamp));
            }
        }
        self.sort();

        debug!(turn_id = %turn_id, role = %fragment.role, is_final = fragment.is_final, "Voice fragment folded into text turn");
        Outcome {
            change: Change::Folded,
            turn_id: Some(turn_id),
            finalized,
        }
    }

    fn effective_text(&self, fragment: &Fragment) -> String {
        if !fragment.text.trim().is_empty() {
            return fragment.text.clone();
        }
        let lane = fragment.lane();
        if lane == Lane::UserVoice {
            return self.partial.as_ref().map(|p| p.text.clone()).unwrap_or_default();
        }
        self.cursor_index(lane)
            .map(|index| self.turns[index].text.clone())
            .unwrap_or_default()
    }

    fn is_duplicate_final(&self, fragment: &Fragment, normalized: &str) -> bool {
        if let Some(item_id) = &fragment.item_id {
            if self.finalized_items.iter().any(|seen| seen == item_id) {
                return true;
            }
        }
        self.last_final
            .get(fragment.role)
            .as_ref()
            .is_some_and(|record| {
                record.matches(normalized, fragment.timestamp, self.config.final_dedup_window_ms)
            })
    }

    fn is_typed_echo(&self, normalized: &str, timestamp: u64) -> bool {
        self.recently_typed
            .as_ref()
            .is_some_and(|record| record.matches(normalized, timestamp, self.config.typed_echo_window_ms))
    }

    /// Abandon whatever the lane was streaming after a dropped final.
    fn discard_lane(&mut self, lane: Lane) {
        if lane == Lane::UserVoice {
            self.partial = None;
        }
        if let Some(turn_id) = self.cursors.get_mut(lane).take() {
            self.turns.retain(|t| t.id != turn_id);
        }
    }

    fn cursor_index(&self, lane: Lane) -> Option<usize> {
        let turn_id = self.cursors.get(lane).as_ref()?;
        self.turns.iter().position(|t| &t.id == turn_id)
    }

    fn create_turn(&mut self, fragment: &Fragment, text: String) -> usize {
        let lane = fragment.lane();
        let (timestamp, item_id) = match (lane, &self.partial) {
            (Lane::UserVoice, Some(partial)) => (
                partial.started_at.min(fragment.timestamp),
                fragment.item_id.clone().or_else(|| partial.item_id.clone()),
            ),
            _ => (fragment.timestamp, fragment.item_id.clone()),
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.turns.push(Turn {
            id: format!("turn-{}", sequence),
            role: fragment.role,
            channel: fragment.channel,
            text,
            timestamp,
            sequence,
            pending: !fragment.is_final,
            item_id,
        });
        self.turns.len() - 1
    }

    fn finalize(&mut self, index: usize, timestamp: u64) -> Turn {
        let turn = &mut self.turns[index];
        turn.pending = false;
        let lane = turn.lane();
        let record = TextRecord {
            normalized: normalize_text(&turn.text),
            timestamp,
        };

        if self.cursors.get(lane).as_deref() == Some(turn.id.as_str()) {
            *self.cursors.get_mut(lane) = None;
        }
        if lane == Lane::UserVoice {
            self.partial = None;
        }
        if lane == Lane::UserText {
            self.recently_typed = Some(record.clone());
        }
        if let Some(item_id) = &turn.item_id {
            if self.finalized_items.len() == FINALIZED_ITEMS_CAPACITY {
                self.finalized_items.pop_front();
            }
            self.finalized_items.push_back(item_id.clone());
        }
        let finalized = turn.clone();
        *self.last_final.get_mut(finalized.role) = Some(record);
        finalized
    }

    fn sort(&mut self) {
        self.turns.sort_by_key(Turn::order_key);
    }
}
