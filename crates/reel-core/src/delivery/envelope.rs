//! Replay envelopes
//!
//! Wire format: the envelope header as one JSON line, then for every item a
//! JSON item header line followed by the raw payload.

use serde::Serialize;
use serde_json::{json, Value};

/// SDK identification attached to envelopes and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

impl Default for SdkInfo {
    fn default() -> Self {
        Self {
            name: "reel.rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeHeaders {
    pub event_id: String,
    /// RFC 3339
    pub sent_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
    /// Only set when sending through a tunnel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeItem {
    ReplayEvent(Value),
    /// `{"segment_id":N}\n` followed by the recording
    ReplayRecording(Vec<u8>),
}

impl EnvelopeItem {
    fn header(&self) -> Value {
        match self {
            EnvelopeItem::ReplayEvent(_) => json!({ "type": "replay_event" }),
            EnvelopeItem::ReplayRecording(payload) => {
                json!({ "type": "replay_recording", "length": payload.len() })
            }
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            EnvelopeItem::ReplayEvent(event) => serde_json::to_vec(event).unwrap_or_else(|e| {
                tracing::warn!("Failed to serialize replay event: {e}");
                b"{}".to_vec()
            }),
            EnvelopeItem::ReplayRecording(payload) => payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub headers: EnvelopeHeaders,
    pub items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn new(headers: EnvelopeHeaders) -> Self {
        Self {
            headers,
            items: Vec::new(),
        }
    }

    pub fn add_item(mut self, item: EnvelopeItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn replay_event(&self) -> Option<&Value> {
        self.items.iter().find_map(|item| match item {
            EnvelopeItem::ReplayEvent(event) => Some(event),
            EnvelopeItem::ReplayRecording(_) => None,
        })
    }

    pub fn recording(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|item| match item {
            EnvelopeItem::ReplayRecording(payload) => Some(payload.as_slice()),
            EnvelopeItem::ReplayEvent(_) => None,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec(&self.headers).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize envelope headers: {e}");
            b"{}".to_vec()
        });

        for item in &self.items {
            out.push(b'\n');
            out.extend_from_slice(item.header().to_string().as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&item.payload());
        }
        out
    }
}

/// Prefix the recording with its segment header
pub fn prepare_recording_data(segment_id: u64, recording: &[u8]) -> Vec<u8> {
    let header = format!("{}\n", json!({ "segment_id": segment_id }));
    let mut payload = Vec::with_capacity(header.len() + recording.len());
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(recording);
    payload
}
