//! Event buffers
//!
//! Recording events are accumulated in an [`EventBuffer`] between flushes.
//! Three backends exist:
//!
//! - [`EventBufferArray`] keeps events in memory and serializes them on finish
//! - [`CompressionWorkerBuffer`] streams events into the compression worker
//! - [`EventBufferProxy`] starts on an array and upgrades to the worker once
//!   it is ready, falling back to the array for good if it never is
//!
//! Every backend enforces the same hard size cap over the serialized events.

mod array;
mod compression;
mod proxy;

pub use array::EventBufferArray;
pub use compression::CompressionWorkerBuffer;
pub use proxy::EventBufferProxy;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ReplayConfig;
use crate::recording::RecordingEvent;
use crate::worker::{WorkerError, WorkerHandler};

/// Buffer errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Event buffer exceeded maximum size")]
    SizeExceeded,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Which backend currently holds the events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// In-memory array
    Sync,
    /// Compression worker
    Worker,
}

/// Payload drained from a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingData {
    /// JSON array of events
    Text(String),
    /// zlib-compressed JSON array of events
    Compressed(Vec<u8>),
}

impl RecordingData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RecordingData::Text(text) => text.as_bytes(),
            RecordingData::Compressed(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A size-bounded store of recording events
///
/// `add_event` and `finish` enqueue their work before returning, so the
/// payload returned by `finish` reflects every `add_event` issued before it
/// even if those futures have not been awaited yet.
pub trait EventBuffer: Send + Sync {
    fn kind(&self) -> BufferKind;

    fn has_events(&self) -> bool;

    /// Whether the buffer contains a checkout (full snapshot)
    fn has_checkout(&self) -> bool;

    fn set_has_checkout(&self, value: bool);

    /// Whether events are dropped until the next checkout
    fn wait_for_checkout(&self) -> bool;

    fn set_wait_for_checkout(&self, value: bool);

    /// Timestamp (ms) of the earliest buffered event
    fn earliest_timestamp(&self) -> Option<u64>;

    fn add_event(&self, event: &RecordingEvent) -> BoxFuture<'static, Result<(), BufferError>>;

    /// Drain all events into a payload and reset the buffer
    fn finish(&self) -> BoxFuture<'static, Result<RecordingData, BufferError>>;

    fn clear(&self);

    fn destroy(&self);
}

/// Pick a buffer for `config`: a worker-upgrading proxy when compression is
/// enabled and the worker can be spawned, otherwise a plain array
pub fn create_event_buffer(config: &ReplayConfig) -> Arc<dyn EventBuffer> {
    let max_size = config.max_event_buffer_size;

    if config.use_compression {
        match WorkerHandler::spawn_compression_worker() {
            Ok(worker) => {
                tracing::debug!("Using compression worker");
                return Arc::new(EventBufferProxy::new(worker, max_size));
            }
            Err(e) => {
                tracing::warn!("Failed to create compression worker: {e}");
            }
        }
    }

    tracing::debug!("Using simple buffer");
    Arc::new(EventBufferArray::new(max_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_array_buffer_without_compression() {
        let config = ReplayConfig::default().with_compression(false);
        let buffer = create_event_buffer(&config);
        assert_eq!(buffer.kind(), BufferKind::Sync);
        assert!(!buffer.has_events());
    }

    #[tokio::test]
    async fn test_create_proxy_upgrades_to_worker() {
        let config = ReplayConfig::default();
        let buffer = create_event_buffer(&config);

        buffer
            .add_event(&RecordingEvent::new(
                crate::recording::EventType::Meta,
                1,
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let data = buffer.finish().await.unwrap();
        assert!(matches!(data, RecordingData::Compressed(_)));
        assert_eq!(buffer.kind(), BufferKind::Worker);
        buffer.destroy();
    }

    #[test]
    fn test_recording_data_len() {
        assert!(RecordingData::Text(String::new()).is_empty());
        assert_eq!(RecordingData::Compressed(vec![1, 2, 3]).len(), 3);
    }
}
