//! Segment delivery
//!
//! A flushed segment becomes one envelope holding a `replay_event` item and
//! a `replay_recording` item. [`ReplaySender::send_replay`] delivers it:
//!
//! - transport failures are retried with growing backoff (5s, 10s, 30s)
//!   and give up after the third retry
//! - non-2xx responses and rate-limit responses are not retried
//! - a category that is still rate limited is refused before sending

pub mod envelope;
pub mod rate_limit;
pub mod transport;

pub use envelope::{Envelope, EnvelopeHeaders, EnvelopeItem, SdkInfo};
pub use rate_limit::RateLimits;
pub use transport::{Dsn, Transport, TransportError, TransportResponse};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

use chrono::{SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::buffer::RecordingData;
use crate::clock::Clock;
use crate::config::defaults::{REPLAY_EVENT_NAME, RETRY_BASE_INTERVAL, RETRY_MAX_COUNT};
use crate::error::ReplayError;
use crate::events::{EventSink, NoOpEventSink};
use crate::session::Sampled;

/// Data category of replay envelopes
pub const REPLAY_CATEGORY: &str = "replay";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendReplayError {
    #[error("Unable to send Replay")]
    Transport(#[source] TransportError),

    #[error("Transport returned status code {0}")]
    StatusCode(u16),

    #[error("Rate limit hit")]
    RateLimited,

    #[error("Unable to send Replay - max retries exceeded")]
    MaxRetries(#[source] TransportError),
}

impl SendReplayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendReplayError::Transport(_))
    }

    /// Outcome reason recorded when the segment is dropped
    pub fn dropped_reason(&self) -> &'static str {
        match self {
            SendReplayError::RateLimited => "ratelimit_backoff",
            _ => "send_error",
        }
    }
}

/// Per-segment context, snapshotted when a segment is flushed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentContext {
    /// Epoch ms of the first event of the segment
    pub initial_timestamp: u64,
    pub error_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub urls: Vec<String>,
}

/// Everything needed to deliver one segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub recording_data: RecordingData,
    pub replay_id: String,
    pub segment_id: u64,
    pub context: SegmentContext,
    /// Epoch ms of the flush
    pub timestamp: u64,
    pub replay_type: Sampled,
}

/// Hook that may rewrite or drop a replay event before it is sent
pub trait EventProcessor: Send + Sync {
    fn process(&self, event: Value) -> Option<Value>;
}

pub struct ReplaySender {
    transport: Arc<dyn Transport>,
    dsn: Option<Dsn>,
    tunnel: bool,
    sdk: SdkInfo,
    rate_limits: Mutex<RateLimits>,
    event_processor: Option<Arc<dyn EventProcessor>>,
    sink: Arc<dyn EventSink>,
    capture_exceptions: bool,
    clock: Clock,
}

impl ReplaySender {
    pub fn new(transport: Arc<dyn Transport>, clock: Clock) -> Self {
        Self {
            transport,
            dsn: None,
            tunnel: false,
            sdk: SdkInfo::default(),
            rate_limits: Mutex::new(RateLimits::new()),
            event_processor: None,
            sink: Arc::new(NoOpEventSink),
            capture_exceptions: false,
            clock,
        }
    }

    pub fn with_dsn(mut self, dsn: Dsn) -> Self {
        self.dsn = Some(dsn);
        self
    }

    /// The transport posts to a tunnel; the DSN travels in the envelope header
    pub fn with_tunnel(mut self, tunnel: bool) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_sdk(mut self, sdk: SdkInfo) -> Self {
        self.sdk = sdk;
        self
    }

    pub fn with_event_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.event_processor = Some(processor);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Forward each failed attempt to the sink's exception capture
    pub fn with_capture_exceptions(mut self, enabled: bool) -> Self {
        self.capture_exceptions = enabled;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limits
            .lock()
            .is_rate_limited(REPLAY_CATEGORY, self.clock.now_ms())
    }

    /// Deliver a segment, retrying transport failures
    ///
    /// Returns `Ok(false)` when nothing was sent (empty recording, or the
    /// event processor dropped the event).
    pub async fn send_replay(&self, segment: &Segment) -> Result<bool, SendReplayError> {
        if segment.recording_data.is_empty() {
            return Ok(false);
        }

        let mut count: u32 = 0;
        let mut interval = RETRY_BASE_INTERVAL;

        loop {
            let error = match self.send_replay_request(segment).await {
                Ok(sent) => return Ok(sent),
                Err(SendReplayError::Transport(error)) => error,
                Err(e) => return Err(e),
            };

            tracing::warn!(
                replay_id = %segment.replay_id,
                segment_id = segment.segment_id,
                attempt = count + 1,
                "Failed to send replay segment: {error}"
            );
            if self.capture_exceptions {
                let captured = ReplayError::Send(SendReplayError::Transport(error.clone()));
                if let Err(e) = self.sink.capture_exception(&captured) {
                    tracing::debug!("Failed to capture exception: {e}");
                }
            }

            if count >= RETRY_MAX_COUNT {
                return Err(SendReplayError::MaxRetries(error));
            }
            count += 1;
            interval *= u64::from(count);
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
    }

    /// One delivery attempt
    pub async fn send_replay_request(&self, segment: &Segment) -> Result<bool, SendReplayError> {
        let now = self.clock.now_ms();
        if self.rate_limits.lock().is_rate_limited(REPLAY_CATEGORY, now) {
            return Err(SendReplayError::RateLimited);
        }

        let base_event = self.replay_event(segment);
        let event = match &self.event_processor {
            Some(processor) => processor.process(base_event),
            None => Some(base_event),
        };
        let Some(event) = event else {
            tracing::debug!("An event processor returned `None`, will not send event");
            if let Err(e) = self.sink.emit_dropped_event("event_processor", REPLAY_CATEGORY) {
                tracing::debug!("Failed to record dropped event: {e}");
            }
            return Ok(false);
        };

        let envelope = self.envelope(event, segment, now);
        let response = self
            .transport
            .send(envelope)
            .await
            .map_err(SendReplayError::Transport)?;

        if let Some(status) = response.status_code {
            if !(200..300).contains(&status) {
                if status == 429 {
                    self.rate_limits
                        .lock()
                        .update_from_response(&response, self.clock.now_ms());
                }
                return Err(SendReplayError::StatusCode(status));
            }
        }

        let mut limits = self.rate_limits.lock();
        limits.update_from_response(&response, self.clock.now_ms());
        if limits.is_rate_limited(REPLAY_CATEGORY, self.clock.now_ms()) {
            return Err(SendReplayError::RateLimited);
        }
        Ok(true)
    }

    fn replay_event(&self, segment: &Segment) -> Value {
        let context = &segment.context;
        json!({
            "type": REPLAY_EVENT_NAME,
            "replay_start_timestamp": context.initial_timestamp as f64 / 1000.0,
            "timestamp": segment.timestamp as f64 / 1000.0,
            "error_ids": context.error_ids,
            "trace_ids": context.trace_ids,
            "urls": context.urls,
            "replay_id": segment.replay_id,
            "segment_id": segment.segment_id,
            "replay_type": segment.replay_type.as_str(),
            "event_id": segment.replay_id,
            "platform": "javascript",
            "sdk": self.sdk,
        })
    }

    fn envelope(&self, event: Value, segment: &Segment, now: u64) -> Envelope {
        let event_id = event
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let headers = EnvelopeHeaders {
            event_id,
            sent_at: format_rfc3339(now),
            sdk: Some(self.sdk.clone()),
            dsn: self
                .dsn
                .as_ref()
                .filter(|_| self.tunnel)
                .map(|dsn| dsn.to_string()),
        };

        let recording = envelope::prepare_recording_data(
            segment.segment_id,
            segment.recording_data.as_bytes(),
        );

        Envelope::new(headers)
            .add_item(EnvelopeItem::ReplayEvent(event))
            .add_item(EnvelopeItem::ReplayRecording(recording))
    }
}

fn format_rfc3339(epoch_ms: u64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms as i64).single() {
        Some(time) => time.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Transport that records envelopes and answers from a script
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<Envelope>>,
        pub script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        /// Simulated request latency in ms
        pub latency: u64,
    }

    impl RecordingTransport {
        pub fn with_latency(latency: u64) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        pub fn push(&self, result: Result<TransportResponse, TransportError>) {
            self.script.lock().push_back(result);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn segment_ids(&self) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter_map(|e| e.replay_event()?.get("segment_id")?.as_u64())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, envelope: Envelope) -> Result<TransportResponse, TransportError> {
            if self.latency > 0 {
                tokio::time::sleep(Duration::from_millis(self.latency)).await;
            }
            self.sent.lock().push(envelope);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::with_status(200)))
        }
    }
}
