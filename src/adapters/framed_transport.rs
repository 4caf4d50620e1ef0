use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapters::data_channel::{encode, DataChannelDecoder};
use crate::domain::{epoch_millis, CoreError};
use crate::ports::{
    ConnectContext, FrameChannel, InboundFrame, OutboundMessage, RealtimeTransport, Signaling,
    TransportControl, TransportEvent, TransportLink,
};

const EVENT_BUFFER: usize = 256;

/// Realtime transport speaking JSON over a signaling-provided data channel.
pub struct FramedTransport<S> {
    signaling: S,
}

impl<S: Signaling> FramedTransport<S> {
    pub fn new(signaling: S) -> Self {
        Self { signaling }
    }
}

struct FramedControl {
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    input_enabled: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportControl for FramedControl {
    fn set_input_enabled(&self, enabled: bool) {
        self.input_enabled.send_replace(enabled);
    }

    fn send(&self, message: OutboundMessage) -> Result<(), CoreError> {
        let frames = encode(&message)?;
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| CoreError::Transport("data channel closed".to_string()))?;
        for frame in frames {
            tx.try_send(frame)
                .map_err(|e| CoreError::Transport(format!("data channel send failed: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl<S: Signaling> RealtimeTransport for FramedTransport<S> {
    async fn negotiate(&self, context: &ConnectContext) -> Result<TransportLink, CoreError> {
        let FrameChannel {
            mut inbound,
            outbound,
            input_enabled,
        } = self.signaling.connect(context).await?;
        let operation = context.operation;
        debug!(operation, "Data channel open");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(async move {
            let mut decoder = DataChannelDecoder::new();
            let mut reason = None;
            while let Some(frame) = inbound.recv().await {
                let event = match frame {
                    InboundFrame::Text(text) => match decoder.decode(&text, epoch_millis()) {
                        Ok(Some(event)) => event,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(operation, error = %e, "Undecodable data channel frame");
                            continue;
                        }
                    },
                    InboundFrame::Audio(bytes) => TransportEvent::Audio { bytes },
                    InboundFrame::Closed(r) => {
                        reason = r;
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(TransportLink {
            events: rx,
            control: Arc::new(FramedControl {
                outbound: Mutex::new(Some(outbound)),
                input_enabled,
                reader: Mutex::new(Some(reader)),
            }),
        })
    }
}
