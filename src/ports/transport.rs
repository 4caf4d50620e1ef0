use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::domain::{CoreError, Fragment};
use crate::ports::backend::TransportToken;

/// Everything one connect attempt needs, scoped to its operation stamp.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub operation: u64,
    pub attempt: u32,
    pub session_id: String,
    pub voice: String,
    pub language: String,
    pub token: TransportToken,
}

/// Discrete event delivered by the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound audio frame from the counterpart.
    Audio { bytes: usize },
    /// Transcript fragment for either role.
    Transcript(Fragment),
    /// The recognizer detected the start of user speech.
    SpeechStarted { timestamp: u64 },
    /// Protocol-level error reported by the remote end.
    Error { message: String },
    /// The channel closed.
    Closed { reason: Option<String> },
}

/// Outbound message on the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// A message the user typed.
    UserText { text: String },
    /// Replacement instructions for the counterpart.
    Instructions { text: String },
}

/// Control handle of an established transport.
#[async_trait]
pub trait TransportControl: Send + Sync {
    /// Enable or disable microphone input without tearing down.
    fn set_input_enabled(&self, enabled: bool);

    /// Send a message over the data channel.
    fn send(&self, message: OutboundMessage) -> Result<(), CoreError>;

    /// Tear down the transport.
    async fn close(&self);
}

/// An established realtime transport.
pub struct TransportLink {
    pub events: mpsc::Receiver<TransportEvent>,
    pub control: Arc<dyn TransportControl>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Port for the realtime transport.
///
/// Implementations perform the offer/answer negotiation and return the
/// bidirectional channel. The wire format is opaque to the core.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn negotiate(&self, context: &ConnectContext) -> Result<TransportLink, CoreError>;
}

/// Raw frame delivered by a negotiated data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// JSON text frame.
    Text(String),
    /// Inbound audio frame of the given size.
    Audio(usize),
    Closed(Option<String>),
}

/// Frame-level half of a negotiated connection.
#[derive(Debug)]
pub struct FrameChannel {
    pub inbound: mpsc::Receiver<InboundFrame>,
    pub outbound: mpsc::Sender<String>,
    /// Microphone gate observed by the media side.
    pub input_enabled: watch::Sender<bool>,
}

/// Port for the offer/answer exchange of a media stack.
///
/// Implementations own the peer connection and expose its data channel as
/// text frames; JSON framing is handled by the core.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn connect(&self, context: &ConnectContext) -> Result<FrameChannel, CoreError>;
}
