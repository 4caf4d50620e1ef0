use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Realtime connection state machine.
///
/// State transitions:
/// - Idle -> Connecting (start)
/// - Error -> Connecting (start, user retry)
/// - Connecting -> Connected (transport negotiated)
/// - Connecting -> Error (retries exhausted, no capture device)
/// - Connected -> Idle (stop, transport closed)
/// - Connecting -> Idle (stop)
///
/// Mic pause is orthogonal and does not change the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionStatus {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionStatus {
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(self, ConnectionStatus::Idle | ConnectionStatus::Error)
    }

    #[must_use]
    pub fn can_pause(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Connecting or connected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }
}

impl From<u8> for ConnectionStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Idle,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Error,
        }
    }
}

impl From<ConnectionStatus> for u8 {
    fn from(status: ConnectionStatus) -> Self {
        status as u8
    }
}

/// Atomic wrapper for ConnectionStatus for lock-free reads.
#[derive(Debug)]
pub struct AtomicConnectionStatus(AtomicU8);

impl AtomicConnectionStatus {
    pub fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status.into()))
    }

    pub fn load(&self) -> ConnectionStatus {
        self.0.load(Ordering::Acquire).into()
    }

    /// Store a new status, returning the previous one.
    pub fn swap(&self, status: ConnectionStatus) -> ConnectionStatus {
        self.0.swap(status.into(), Ordering::AcqRel).into()
    }

    /// Compare and swap, returns true if successful.
    pub fn compare_exchange(&self, current: ConnectionStatus, new: ConnectionStatus) -> bool {
        self.0
            .compare_exchange(current.into(), new.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionStatus::Idle)
    }
}

/// Process-wide epoch counter. Work captured under an older generation is
/// dropped once the counter advances.
#[derive(Debug, Default)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance the generation and return the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Per-connect-attempt stamp, independent of the generation counter.
///
/// `issued` only grows. `live` holds the operation allowed to act, or 0
/// once it has been invalidated.
#[derive(Debug, Default)]
pub struct OperationStamp {
    issued: AtomicU64,
    live: AtomicU64,
}

impl OperationStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live operation, 0 when none.
    pub fn current(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    /// Highest operation ever allocated.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    /// Allocate the next operation, invalidating every earlier one.
    pub fn next(&self) -> u64 {
        let operation = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        self.live.fetch_max(operation, Ordering::AcqRel);
        operation
    }

    /// Invalidate whatever operation is live. Returns it (0 if none).
    pub fn invalidate(&self) -> u64 {
        self.live.swap(0, Ordering::AcqRel)
    }

    /// Invalidate `operation` only if it is still live.
    pub fn retire(&self, operation: u64) -> bool {
        self.live
            .compare_exchange(operation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_current(&self, operation: u64) -> bool {
        operation != 0 && self.current() == operation
    }
}

/// The counterpart and scenario the user is conversing in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub counterpart_id: String,
    pub scenario_id: String,
}

impl Selection {
    pub fn new(counterpart_id: impl Into<String>, scenario_id: impl Into<String>) -> Self {
        Self {
            counterpart_id: counterpart_id.into(),
            scenario_id: scenario_id.into(),
        }
    }
}

/// Backend-tracked session resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub phase: Option<String>,
    /// Outstanding preconditions reported by the backend.
    pub gate: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(ConnectionStatus::Idle.can_start());
        assert!(ConnectionStatus::Error.can_start());
        assert!(!ConnectionStatus::Connecting.can_start());
        assert!(!ConnectionStatus::Connected.can_start());

        assert!(ConnectionStatus::Connected.can_pause());
        assert!(!ConnectionStatus::Connecting.can_pause());

        assert!(ConnectionStatus::Connecting.is_active());
        assert!(ConnectionStatus::Connected.is_active());
        assert!(!ConnectionStatus::Idle.is_active());
        assert!(!ConnectionStatus::Error.is_active());
    }

    #[test]
    fn test_atomic_status() {
        let status = AtomicConnectionStatus::default();
        assert_eq!(status.load(), ConnectionStatus::Idle);

        assert_eq!(status.swap(ConnectionStatus::Connecting), ConnectionStatus::Idle);
        assert!(status.compare_exchange(ConnectionStatus::Connecting, ConnectionStatus::Connected));
        assert!(!status.compare_exchange(ConnectionStatus::Idle, ConnectionStatus::Error));
        assert_eq!(status.load(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_generation_is_monotonic() {
        let generation = GenerationCounter::new();
        let g0 = generation.current();
        let g1 = generation.bump();
        assert_eq!(g1, g0 + 1);
        assert!(!generation.is_current(g0));
        assert!(generation.is_current(g1));
    }

    #[test]
    fn test_operation_stamp_invalidates_previous() {
        let stamp = OperationStamp::new();
        let first = stamp.next();
        let second = stamp.next();
        assert!(!stamp.is_current(first));
        assert!(stamp.is_current(second));
    }

    #[test]
    fn test_invalidate_keeps_numbering() {
        let stamp = OperationStamp::new();
        for _ in 0..4 {
            stamp.next();
        }
        let fifth = stamp.next();
        assert_eq!(fifth, 5);

        assert_eq!(stamp.invalidate(), 5);
        assert!(!stamp.is_current(fifth));
        assert_eq!(stamp.current(), 0);

        assert_eq!(stamp.next(), 6);
        assert_eq!(stamp.issued(), 6);
    }

    #[test]
    fn test_retire_only_matches_live() {
        let stamp = OperationStamp::new();
        let first = stamp.next();
        let second = stamp.next();
        assert!(!stamp.retire(first));
        assert!(stamp.is_current(second));
        assert!(stamp.retire(second));
        assert!(!stamp.is_current(second));
        assert!(!stamp.is_current(0));
    }
}
