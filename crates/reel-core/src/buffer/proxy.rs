use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{
    BufferError, BufferKind, CompressionWorkerBuffer, EventBuffer, EventBufferArray, RecordingData,
};
use crate::recording::RecordingEvent;
use crate::worker::WorkerHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    /// Worker readiness unknown, events go to the array
    Upgrading,
    WorkerBacked,
    /// Worker failed to load, the array is used for good
    Fallback,
}

struct ProxyInner {
    state: Mutex<ProxyState>,
    fallback: EventBufferArray,
    compression: CompressionWorkerBuffer,
}

impl ProxyInner {
    fn active(&self) -> &dyn EventBuffer {
        match *self.state.lock() {
            ProxyState::WorkerBacked => &self.compression,
            ProxyState::Upgrading | ProxyState::Fallback => &self.fallback,
        }
    }
}

/// Array buffer that upgrades itself to the compression worker
///
/// The upgrade runs once, in the background, from construction. Until it
/// completes events land in the array. On success every buffered event is
/// handed to the worker in its original order before new events are routed
/// there.
pub struct EventBufferProxy {
    inner: Arc<ProxyInner>,
    upgrade: Shared<BoxFuture<'static, ()>>,
}

impl EventBufferProxy {
    /// Must be called inside a tokio runtime
    pub fn new(worker: WorkerHandler, max_size: usize) -> Self {
        let inner = Arc::new(ProxyInner {
            state: Mutex::new(ProxyState::Upgrading),
            fallback: EventBufferArray::new(max_size),
            compression: CompressionWorkerBuffer::new(Arc::new(worker), max_size),
        });

        let task = tokio::spawn(upgrade(inner.clone()));
        let upgrade = task.map(|_| ()).boxed().shared();

        Self { inner, upgrade }
    }

    /// Resolves once the buffer settled on a backend
    pub async fn ensure_worker_is_loaded(&self) {
        self.upgrade.clone().await;
    }
}

async fn upgrade(inner: Arc<ProxyInner>) {
    if let Err(e) = inner.compression.ensure_ready().await {
        tracing::warn!("Failed to load the compression worker, falling back to simple buffer: {e}");
        *inner.state.lock() = ProxyState::Fallback;
        return;
    }

    let pending = {
        let mut state = inner.state.lock();
        let has_checkout = inner.fallback.has_checkout();
        let wait_for_checkout = inner.fallback.wait_for_checkout();
        let events = inner.fallback.drain();

        let pending: Vec<_> = events
            .iter()
            .map(|event| inner.compression.add_event(event))
            .collect();
        inner.compression.set_has_checkout(has_checkout);
        inner.compression.set_wait_for_checkout(wait_for_checkout);

        *state = ProxyState::WorkerBacked;
        pending
    };

    for result in futures_util::future::join_all(pending).await {
        if let Err(e) = result {
            tracing::warn!("Failed to add events when switching buffers: {e}");
        }
    }
    tracing::debug!("Switched to compression worker buffer");
}

impl EventBuffer for EventBufferProxy {
    fn kind(&self) -> BufferKind {
        self.inner.active().kind()
    }

    fn has_events(&self) -> bool {
        self.inner.active().has_events()
    }

    fn has_checkout(&self) -> bool {
        self.inner.active().has_checkout()
    }

    fn set_has_checkout(&self, value: bool) {
        self.inner.active().set_has_checkout(value);
    }

    fn wait_for_checkout(&self) -> bool {
        self.inner.active().wait_for_checkout()
    }

    fn set_wait_for_checkout(&self, value: bool) {
        self.inner.active().set_wait_for_checkout(value);
    }

    fn earliest_timestamp(&self) -> Option<u64> {
        self.inner.active().earliest_timestamp()
    }

    fn add_event(&self, event: &RecordingEvent) -> BoxFuture<'static, Result<(), BufferError>> {
        // State is checked and the event enqueued under the same lock so an
        // upgrade cannot slip in between
        let state = self.inner.state.lock();
        match *state {
            ProxyState::WorkerBacked => self.inner.compression.add_event(event),
            ProxyState::Upgrading | ProxyState::Fallback => self.inner.fallback.add_event(event),
        }
    }

    fn finish(&self) -> BoxFuture<'static, Result<RecordingData, BufferError>> {
        let inner = self.inner.clone();
        let upgrade = self.upgrade.clone();
        async move {
            upgrade.await;
            let pending = inner.active().finish();
            pending.await
        }
        .boxed()
    }

    fn clear(&self) {
        self.inner.active().clear();
    }

    fn destroy(&self) {
        self.inner.fallback.destroy();
        self.inner.compression.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::EventType;
    use crate::worker::compressor::decompress;
    use crate::worker::testing::{ok, ready_signal, stub_handler};
    use crate::worker::{WorkerEvent, WorkerMethod, WorkerPayload};
    use serde_json::json;

    fn event(timestamp: u64) -> RecordingEvent {
        RecordingEvent::new(EventType::IncrementalSnapshot, timestamp, json!({"source": 0}))
    }

    #[tokio::test]
    async fn test_events_before_upgrade_are_migrated_in_order() {
        let proxy = EventBufferProxy::new(WorkerHandler::spawn_compression_worker().unwrap(), 100_000);

        // Likely still upgrading here; either way the order must hold
        for ts in 1..=5 {
            proxy.add_event(&event(ts)).await.unwrap();
        }
        proxy.ensure_worker_is_loaded().await;
        assert_eq!(proxy.kind(), BufferKind::Worker);

        for ts in 6..=8 {
            proxy.add_event(&event(ts)).await.unwrap();
        }

        let RecordingData::Compressed(bytes) = proxy.finish().await.unwrap() else {
            panic!("upgraded proxy returns bytes");
        };
        let parsed: Vec<RecordingEvent> = serde_json::from_str(&decompress(&bytes)).unwrap();
        let timestamps: Vec<u64> = parsed.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, (1..=8).collect::<Vec<_>>());
        proxy.destroy();
    }

    #[tokio::test]
    async fn test_migration_carries_checkout_flags() {
        let (handler, channel, events) = stub_handler();
        let proxy = EventBufferProxy::new(handler, 100_000);

        proxy.set_has_checkout(true);
        proxy.add_event(&event(1)).await.unwrap();
        proxy.add_event(&event(2)).await.unwrap();

        events.send(ready_signal()).unwrap();
        // Acknowledge both migrated events
        for _ in 0..50 {
            if channel.posted.lock().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let posted = channel.posted.lock().clone();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].method, WorkerMethod::AddEvent);
        assert!(posted[0].arg.as_deref().unwrap().contains(r#""timestamp":1"#));
        assert!(posted[1].arg.as_deref().unwrap().contains(r#""timestamp":2"#));
        for request in &posted {
            events
                .send(ok(request.id, request.method, WorkerPayload::Empty))
                .unwrap();
        }

        proxy.ensure_worker_is_loaded().await;
        assert_eq!(proxy.kind(), BufferKind::Worker);
        assert!(proxy.has_checkout());
        assert_eq!(proxy.earliest_timestamp(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_worker_falls_back_to_array() {
        let (handler, _channel, events) = stub_handler();
        let proxy = EventBufferProxy::new(handler, 100_000);

        proxy.add_event(&event(1)).await.unwrap();
        events
            .send(WorkerEvent::Error("failed to load".to_string()))
            .unwrap();
        proxy.ensure_worker_is_loaded().await;

        assert_eq!(proxy.kind(), BufferKind::Sync);
        proxy.add_event(&event(2)).await.unwrap();

        let RecordingData::Text(text) = proxy.finish().await.unwrap() else {
            panic!("fallback returns text");
        };
        let parsed: Vec<RecordingEvent> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, vec![event(1), event(2)]);
    }

    #[tokio::test]
    async fn test_finish_waits_for_upgrade() {
        let (handler, channel, events) = stub_handler();
        let proxy = EventBufferProxy::new(handler, 100_000);

        let finish = proxy.finish();
        events.send(ready_signal()).unwrap();

        let responder = tokio::spawn(async move {
            loop {
                let finish = channel
                    .posted
                    .lock()
                    .iter()
                    .find(|r| r.method == WorkerMethod::Finish)
                    .cloned();
                if let Some(request) = finish {
                    events
                        .send(ok(request.id, request.method, WorkerPayload::Bytes(vec![7])))
                        .unwrap();
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        assert_eq!(finish.await.unwrap(), RecordingData::Compressed(vec![7]));
        responder.await.unwrap();
    }
}
