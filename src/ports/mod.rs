pub mod backend;
pub mod capture;
pub mod config;
pub mod http;
pub mod transport;

pub use backend::{
    Audience, BackendApi, CreateSessionRequest, CreateSessionResponse, Instructions,
    InstructionsRequest, PersistReport, PersistTurnsRequest, PersistedTurn, TransportToken,
    TransportTokenRequest,
};
pub use capture::CaptureDevice;
pub use config::ConfigStore;
pub use http::HttpClient;
pub use transport::{
    ConnectContext, FrameChannel, InboundFrame, OutboundMessage, RealtimeTransport, Signaling,
    TransportControl, TransportEvent, TransportLink,
};
