//! Transport that prints envelopes instead of sending them

use async_trait::async_trait;
use reel_core::delivery::{Envelope, Transport, TransportError, TransportResponse};
use serde_json::json;

pub struct DryRunTransport {
    json_output: bool,
}

impl DryRunTransport {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn send(&self, envelope: Envelope) -> Result<TransportResponse, TransportError> {
        let bytes = envelope.serialize().len();
        let event = envelope.replay_event();
        let segment_id = event.and_then(|e| e.get("segment_id")).cloned();
        let replay_type = event.and_then(|e| e.get("replay_type")).cloned();

        if self.json_output {
            println!(
                "{}",
                json!({
                    "event": "envelope",
                    "event_id": envelope.headers.event_id,
                    "segment_id": segment_id,
                    "replay_type": replay_type,
                    "bytes": bytes,
                })
            );
        } else {
            println!(
                "Envelope {}: segment {}, {} bytes (dry run)",
                envelope.headers.event_id,
                segment_id.unwrap_or_default(),
                bytes
            );
        }

        Ok(TransportResponse::with_status(200))
    }
}
