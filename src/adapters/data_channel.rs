//! JSON framing of the realtime data channel.
//!
//! Inbound server events are turned into [`TransportEvent`]s. Deltas are
//! accumulated per item so every fragment carries the full text so far and
//! the timestamp of the utterance's first delta.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::domain::{Channel, CoreError, Fragment, Role};
use crate::ports::{OutboundMessage, TransportEvent};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { item_id: String, transcript: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { item_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { item_id: String, transcript: String },
    #[serde(rename = "response.text.delta")]
    TextDelta { item_id: String, delta: String },
    #[serde(rename = "response.text.done")]
    TextDone { item_id: String, text: String },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone)]
struct ItemBuffer {
    text: String,
    started_at: u64,
}

/// Stateful decoder for one data channel.
#[derive(Debug, Default)]
pub struct DataChannelDecoder {
    items: HashMap<String, ItemBuffer>,
}

impl DataChannelDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one text frame received at `now_ms`.
    pub fn decode(&mut self, frame: &str, now_ms: u64) -> Result<Option<TransportEvent>, CoreError> {
        let event: ServerEvent = serde_json::from_str(frame)?;
        let decoded = match event {
            ServerEvent::SpeechStarted { item_id } => {
                if let Some(item_id) = item_id {
                    self.items.entry(item_id).or_insert(ItemBuffer {
                        text: String::new(),
                        started_at: now_ms,
                    });
                }
                Some(TransportEvent::SpeechStarted { timestamp: now_ms })
            }
            ServerEvent::InputTranscriptDelta { item_id, delta } => {
                Some(self.delta(Role::User, Channel::Voice, item_id, &delta, now_ms))
            }
            ServerEvent::InputTranscriptCompleted {
                item_id,
                transcript,
            } => Some(self.done(Role::User, Channel::Voice, item_id, transcript, now_ms)),
            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                Some(self.delta(Role::Assistant, Channel::Voice, item_id, &delta, now_ms))
            }
            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript,
            } => Some(self.done(Role::Assistant, Channel::Voice, item_id, transcript, now_ms)),
            ServerEvent::TextDelta { item_id, delta } => {
                Some(self.delta(Role::Assistant, Channel::Text, item_id, &delta, now_ms))
            }
            ServerEvent::TextDone { item_id, text } => {
                Some(self.done(Role::Assistant, Channel::Text, item_id, text, now_ms))
            }
            ServerEvent::Error { error } => {
                debug!(code = ?error.code, "Realtime error event");
                Some(TransportEvent::Error {
                    message: error.message,
                })
            }
            ServerEvent::Other => None,
        };
        Ok(decoded)
    }

    fn delta(
        &mut self,
        role: Role,
        channel: Channel,
        item_id: String,
        delta: &str,
        now_ms: u64,
    ) -> TransportEvent {
        let buffer = self.items.entry(item_id.clone()).or_insert(ItemBuffer {
            text: String::new(),
            started_at: now_ms,
        });
        buffer.text.push_str(delta);
        trace!(item_id = %item_id, len = buffer.text.len(), "Transcript delta");

        TransportEvent::Transcript(
            Fragment::new(role, channel, buffer.text.clone(), false, buffer.started_at)
                .with_item_id(item_id),
        )
    }

    fn done(
        &mut self,
        role: Role,
        channel: Channel,
        item_id: String,
        text: String,
        now_ms: u64,
    ) -> TransportEvent {
        let (text, started_at) = match self.items.remove(&item_id) {
            Some(buffer) if text.trim().is_empty() => (buffer.text, buffer.started_at),
            Some(buffer) => (text, buffer.started_at),
            None => (text, now_ms),
        };
        TransportEvent::Transcript(
            Fragment::new(role, channel, text, true, started_at).with_item_id(item_id),
        )
    }
}

/// Encode an outbound message into the frames to send, in order.
pub fn encode(message: &OutboundMessage) -> Result<Vec<String>, CoreError> {
    let frames = match message {
        OutboundMessage::UserText { text } => vec![
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": text }],
                },
            }),
            json!({ "type": "response.create" }),
        ],
        OutboundMessage::Instructions { text } => vec![json!({
            "type": "session.update",
            "session": { "instructions": text },
        })],
    };
    frames
        .iter()
        .map(|frame| serde_json::to_string(frame).map_err(CoreError::from))
        .collect()
}
