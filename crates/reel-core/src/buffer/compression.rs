use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{BufferError, BufferKind, EventBuffer, RecordingData};
use crate::recording::RecordingEvent;
use crate::worker::{WorkerError, WorkerHandler, WorkerMethod, WorkerPayload};

#[derive(Debug, Default)]
struct CompressionState {
    total_size: usize,
    earliest_timestamp: Option<u64>,
    has_checkout: bool,
    wait_for_checkout: bool,
}

/// Event buffer that streams events into the compression worker
pub struct CompressionWorkerBuffer {
    worker: Arc<WorkerHandler>,
    state: Mutex<CompressionState>,
    max_size: usize,
}

impl CompressionWorkerBuffer {
    pub fn new(worker: Arc<WorkerHandler>, max_size: usize) -> Self {
        Self {
            worker,
            state: Mutex::new(CompressionState::default()),
            max_size,
        }
    }

    /// Wait for the worker to signal it is ready
    pub async fn ensure_ready(&self) -> Result<(), WorkerError> {
        self.worker.ensure_ready().await
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.total_size = 0;
        state.earliest_timestamp = None;
    }
}

impl EventBuffer for CompressionWorkerBuffer {
    fn kind(&self) -> BufferKind {
        BufferKind::Worker
    }

    fn has_events(&self) -> bool {
        self.state.lock().earliest_timestamp.is_some()
    }

    fn has_checkout(&self) -> bool {
        self.state.lock().has_checkout
    }

    fn set_has_checkout(&self, value: bool) {
        self.state.lock().has_checkout = value;
    }

    fn wait_for_checkout(&self) -> bool {
        self.state.lock().wait_for_checkout
    }

    fn set_wait_for_checkout(&self, value: bool) {
        self.state.lock().wait_for_checkout = value;
    }

    fn earliest_timestamp(&self) -> Option<u64> {
        self.state.lock().earliest_timestamp
    }

    fn add_event(&self, event: &RecordingEvent) -> BoxFuture<'static, Result<(), BufferError>> {
        let data = event.to_json();
        {
            let mut state = self.state.lock();
            state.earliest_timestamp = Some(match state.earliest_timestamp {
                Some(earliest) => earliest.min(event.timestamp),
                None => event.timestamp,
            });
            state.total_size += data.len();
            if state.total_size > self.max_size {
                return future::ready(Err(BufferError::SizeExceeded)).boxed();
            }
        }

        self.worker
            .post_message(WorkerMethod::AddEvent, Some(data))
            .map(|result| result.map(|_| ()).map_err(BufferError::from))
            .boxed()
    }

    fn finish(&self) -> BoxFuture<'static, Result<RecordingData, BufferError>> {
        self.reset();
        self.worker
            .post_message(WorkerMethod::Finish, None)
            .map(|result| match result? {
                WorkerPayload::Bytes(bytes) => Ok(RecordingData::Compressed(bytes)),
                _ => Err(WorkerError::UnexpectedResponse(WorkerMethod::Finish).into()),
            })
            .boxed()
    }

    fn clear(&self) {
        self.reset();
        let pending = self.worker.post_message(WorkerMethod::Clear, None);
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                tracing::warn!("Sending \"clear\" message to worker failed: {e}");
            }
        });
    }

    fn destroy(&self) {
        self.worker.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::EventType;
    use crate::worker::compressor::decompress;
    use serde_json::json;

    fn event(timestamp: u64) -> RecordingEvent {
        RecordingEvent::new(EventType::Meta, timestamp, json!({"href": "http://x"}))
    }

    fn buffer(max_size: usize) -> CompressionWorkerBuffer {
        let worker = WorkerHandler::spawn_compression_worker().unwrap();
        CompressionWorkerBuffer::new(Arc::new(worker), max_size)
    }

    #[tokio::test]
    async fn test_finish_decompresses_to_events_in_order() {
        let buffer = buffer(10_000);
        buffer.ensure_ready().await.unwrap();

        // Not awaited individually: enqueue order is call order
        let first = buffer.add_event(&event(5));
        let second = buffer.add_event(&event(2));
        let finish = buffer.finish();

        first.await.unwrap();
        second.await.unwrap();
        let RecordingData::Compressed(bytes) = finish.await.unwrap() else {
            panic!("worker buffer returns bytes");
        };
        let parsed: Vec<RecordingEvent> = serde_json::from_str(&decompress(&bytes)).unwrap();
        assert_eq!(parsed, vec![event(5), event(2)]);

        assert!(!buffer.has_events());
        assert_eq!(buffer.earliest_timestamp(), None);
        buffer.destroy();
    }

    #[tokio::test]
    async fn test_earliest_timestamp_tracks_minimum() {
        let buffer = buffer(10_000);
        buffer.add_event(&event(5)).await.unwrap();
        buffer.add_event(&event(2)).await.unwrap();
        buffer.add_event(&event(9)).await.unwrap();
        assert_eq!(buffer.earliest_timestamp(), Some(2));
        buffer.destroy();
    }

    #[tokio::test]
    async fn test_size_cap_rejects() {
        let size = event(1).to_json().len();
        let buffer = buffer(size);

        buffer.add_event(&event(1)).await.unwrap();
        assert_eq!(
            buffer.add_event(&event(2)).await,
            Err(BufferError::SizeExceeded)
        );
        buffer.destroy();
    }

    #[tokio::test]
    async fn test_clear_resets_stream() {
        let buffer = buffer(10_000);
        buffer.add_event(&event(1)).await.unwrap();
        buffer.clear();
        assert!(!buffer.has_events());

        buffer.add_event(&event(2)).await.unwrap();
        let RecordingData::Compressed(bytes) = buffer.finish().await.unwrap() else {
            panic!("worker buffer returns bytes");
        };
        let parsed: Vec<RecordingEvent> = serde_json::from_str(&decompress(&bytes)).unwrap();
        assert_eq!(parsed, vec![event(2)]);
        buffer.destroy();
    }
}
