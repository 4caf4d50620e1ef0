pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod turn;

pub use config::CoreConfig;
pub use error::CoreError;
pub use events::{CoreEvent, DiagnosticLevel, DiagnosticSource, Notice};
pub use session::{
    AtomicConnectionStatus, ConnectionStatus, GenerationCounter, OperationStamp, Selection,
    SessionInfo,
};
pub use turn::{
    epoch_millis, normalize_text, Channel, DedupKey, Fragment, Lane, LaneTable, Role, RoleTable,
    Turn,
};
