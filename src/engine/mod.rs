pub mod coordinator;
pub mod dispatch;
pub mod lifecycle;
pub mod orchestrator;
pub mod relay;
pub mod transcript;
pub mod update_queue;

pub use coordinator::{Coordinator, FinalizedHook};
pub use dispatch::{Dispatcher, Flow};
pub use lifecycle::{Lifecycle, SelectionResetHook};
pub use orchestrator::{FinalizeHook, Orchestrator, TrackingResetHook};
pub use relay::{NoticeBoard, Relay, RelayStats};
pub use transcript::{Change, Outcome, TranscriptState};
pub use update_queue::{FlushStats, UpdateQueue};
