use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::{BufferError, BufferKind, EventBuffer, RecordingData};
use crate::recording::RecordingEvent;

#[derive(Debug, Default)]
struct ArrayState {
    events: Vec<RecordingEvent>,
    total_size: usize,
    has_checkout: bool,
    wait_for_checkout: bool,
}

/// In-memory event buffer
#[derive(Debug)]
pub struct EventBufferArray {
    state: Mutex<ArrayState>,
    max_size: usize,
}

impl EventBufferArray {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(ArrayState::default()),
            max_size,
        }
    }

    /// Remove and return the buffered events, resetting the size counter
    pub(crate) fn drain(&self) -> Vec<RecordingEvent> {
        let mut state = self.state.lock();
        state.total_size = 0;
        std::mem::take(&mut state.events)
    }

    fn push(&self, event: &RecordingEvent) -> Result<(), BufferError> {
        let size = event.to_json().len();
        let mut state = self.state.lock();
        state.total_size += size;
        if state.total_size > self.max_size {
            return Err(BufferError::SizeExceeded);
        }
        state.events.push(event.clone());
        Ok(())
    }
}

impl EventBuffer for EventBufferArray {
    fn kind(&self) -> BufferKind {
        BufferKind::Sync
    }

    fn has_events(&self) -> bool {
        !self.state.lock().events.is_empty()
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
        self.state
            .lock()
            .events
            .iter()
            .map(|event| event.timestamp)
            .min()
    }

    fn add_event(&self, event: &RecordingEvent) -> BoxFuture<'static, Result<(), BufferError>> {
        future::ready(self.push(event)).boxed()
    }

    fn finish(&self) -> BoxFuture<'static, Result<RecordingData, BufferError>> {
        let events = self.drain();
        let result = serde_json::to_string(&events).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize recording events: {e}");
            "[]".to_string()
        });
        future::ready(Ok(RecordingData::Text(result))).boxed()
    }

    fn clear(&self) {
        self.drain();
    }

    fn destroy(&self) {
        self.drain();
    }
}
