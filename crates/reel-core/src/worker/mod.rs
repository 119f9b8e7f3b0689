//! Request/response RPC over a compression worker
//!
//! Every call carries a monotonically increasing id. A dispatcher task reads
//! worker events and completes the pending call registered under
//! `(method, id)`, removing it from the table. The first message the worker
//! sends decides readiness; [`WorkerHandler::ensure_ready`] observes that
//! decision for the lifetime of the handler. There is no per-call timeout:
//! calls only fail when the worker reports an error or the channel closes.

pub mod channel;
pub mod compressor;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub use channel::{ThreadWorkerChannel, WorkerChannel};

/// Worker RPC methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerMethod {
    /// Sent once by the worker when it is ready
    Init,
    AddEvent,
    Finish,
    Clear,
    Compress,
}

impl fmt::Display for WorkerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerMethod::Init => "init",
            WorkerMethod::AddEvent => "addEvent",
            WorkerMethod::Finish => "finish",
            WorkerMethod::Clear => "clear",
            WorkerMethod::Compress => "compress",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub id: u64,
    pub method: WorkerMethod,
    pub arg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    /// `None` for unsolicited messages such as the ready signal
    pub id: Option<u64>,
    pub method: WorkerMethod,
    pub success: bool,
    pub response: WorkerPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerPayload {
    Empty,
    Bytes(Vec<u8>),
    Error(String),
}

/// Everything a worker can send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Message(WorkerResponse),
    /// Worker-level failure (load error, crash)
    Error(String),
}

/// Worker errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Failed to spawn compression worker: {0}")]
    Spawn(String),

    #[error("Compression worker failed to start: {0}")]
    NotReady(String),

    #[error("Error in compression worker: {0}")]
    Failed(String),

    #[error("Compression worker terminated")]
    Terminated,

    #[error("Unexpected response from compression worker for {0}")]
    UnexpectedResponse(WorkerMethod),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

type PendingCalls = Arc<Mutex<HashMap<(WorkerMethod, u64), oneshot::Sender<CallResult>>>>;
type CallResult = Result<WorkerPayload, WorkerError>;

pub struct WorkerHandler {
    channel: Arc<dyn WorkerChannel>,
    next_id: AtomicU64,
    pending: PendingCalls,
    ready: watch::Receiver<Readiness>,
    dispatcher: JoinHandle<()>,
}

impl WorkerHandler {
    /// Wrap a worker connection; must be called inside a tokio runtime
    pub fn new(channel: Arc<dyn WorkerChannel>, events: UnboundedReceiver<WorkerEvent>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch(events, ready_tx, pending.clone()));

        Self {
            channel,
            next_id: AtomicU64::new(0),
            pending,
            ready: ready_rx,
            dispatcher,
        }
    }

    /// Spawn the compression worker thread and wrap it
    pub fn spawn_compression_worker() -> Result<Self, WorkerError> {
        let (channel, events) = ThreadWorkerChannel::spawn()?;
        Ok(Self::new(channel, events))
    }

    /// Resolves once the worker signalled it is ready, fails if it signalled an error
    pub async fn ensure_ready(&self) -> Result<(), WorkerError> {
        let mut ready = self.ready.clone();
        let state = ready
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| WorkerError::Terminated)?;

        match &*state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(WorkerError::NotReady(reason.clone())),
            Readiness::Pending => Err(WorkerError::Terminated),
        }
    }

    /// Send a request now and return a future for its response
    ///
    /// The request is enqueued before this returns, so calls reach the worker
    /// in the order they were made regardless of when the futures are polled.
    pub fn post_message(
        &self,
        method: WorkerMethod,
        arg: Option<String>,
    ) -> BoxFuture<'static, CallResult> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((method, id), tx);

        if let Err(e) = self.channel.post(WorkerRequest { id, method, arg }) {
            self.pending.lock().remove(&(method, id));
            return future::ready(Err(e)).boxed();
        }

        async move { rx.await.map_err(|_| WorkerError::Terminated)? }.boxed()
    }

    /// Terminate the worker; outstanding calls fail with `Terminated`
    pub fn destroy(&self) {
        tracing::debug!("Destroying compression worker");
        self.channel.terminate();
        self.pending.lock().clear();
    }
}

impl Drop for WorkerHandler {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut events: UnboundedReceiver<WorkerEvent>,
    ready: watch::Sender<Readiness>,
    pending: PendingCalls,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(response) => {
                if *ready.borrow() == Readiness::Pending {
                    let state = if response.success {
                        Readiness::Ready
                    } else {
                        Readiness::Failed("worker reported failure on startup".to_string())
                    };
                    ready.send_replace(state);
                }

                let Some(id) = response.id else {
                    continue;
                };
                let Some(call) = pending.lock().remove(&(response.method, id)) else {
                    continue;
                };

                let result = if response.success {
                    Ok(response.response)
                } else {
                    let reason = match response.response {
                        WorkerPayload::Error(reason) => reason,
                        _ => "unknown error".to_string(),
                    };
                    tracing::error!(method = %response.method, "Error in compression worker: {reason}");
                    Err(WorkerError::Failed(reason))
                };
                let _ = call.send(result);
            }
            WorkerEvent::Error(reason) => {
                tracing::warn!("Compression worker error: {reason}");
                ready.send_if_modified(|state| {
                    if *state == Readiness::Pending {
                        *state = Readiness::Failed(reason);
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }

    ready.send_if_modified(|state| {
        if *state == Readiness::Pending {
            *state = Readiness::Failed("worker channel closed".to_string());
            true
        } else {
            false
        }
    });
    pending.lock().clear();
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    /// Worker channel that records requests; the test plays the worker
    #[derive(Default)]
    pub(crate) struct StubChannel {
        pub posted: Mutex<Vec<WorkerRequest>>,
        pub terminated: std::sync::atomic::AtomicBool,
    }

    impl WorkerChannel for StubChannel {
        fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(WorkerError::Terminated);
            }
            self.posted.lock().push(request);
            Ok(())
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn stub_handler() -> (WorkerHandler, Arc<StubChannel>, UnboundedSender<WorkerEvent>) {
        let channel = Arc::new(StubChannel::default());
        let (tx, rx) = unbounded_channel();
        let handler = WorkerHandler::new(channel.clone(), rx);
        (handler, channel, tx)
    }

    pub(crate) fn ok(id: u64, method: WorkerMethod, response: WorkerPayload) -> WorkerEvent {
        WorkerEvent::Message(WorkerResponse {
            id: Some(id),
            method,
            success: true,
            response,
        })
    }

    pub(crate) fn ready_signal() -> WorkerEvent {
        WorkerEvent::Message(WorkerResponse {
            id: None,
            method: WorkerMethod::Init,
            success: true,
            response: WorkerPayload::Empty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_thread_worker_roundtrip() {
        let handler = WorkerHandler::spawn_compression_worker().unwrap();
        handler.ensure_ready().await.unwrap();

        let first = handler.post_message(WorkerMethod::AddEvent, Some(r#"{"a":1}"#.to_string()));
        let second = handler.post_message(WorkerMethod::AddEvent, Some(r#"{"b":2}"#.to_string()));
        let finish = handler.post_message(WorkerMethod::Finish, None);

        assert_eq!(first.await.unwrap(), WorkerPayload::Empty);
        assert_eq!(second.await.unwrap(), WorkerPayload::Empty);
        let WorkerPayload::Bytes(bytes) = finish.await.unwrap() else {
            panic!("finish should return bytes");
        };
        assert_eq!(compressor::decompress(&bytes), r#"[{"a":1},{"b":2}]"#);

        handler.destroy();
    }

    #[tokio::test]
    async fn test_ids_increase_and_responses_match_method_and_id() {
        let (handler, channel, events) = stub_handler();

        let add = handler.post_message(WorkerMethod::AddEvent, Some("{}".to_string()));
        let finish = handler.post_message(WorkerMethod::Finish, None);

        let posted = channel.posted.lock().clone();
        assert_eq!(posted[0].id, 0);
        assert_eq!(posted[1].id, 1);

        // Wrong method for id 1, then unknown id: both ignored
        events
            .send(ok(1, WorkerMethod::AddEvent, WorkerPayload::Empty))
            .unwrap();
        events
            .send(ok(7, WorkerMethod::Finish, WorkerPayload::Empty))
            .unwrap();
        events
            .send(ok(1, WorkerMethod::Finish, WorkerPayload::Bytes(vec![1, 2])))
            .unwrap();
        events
            .send(ok(0, WorkerMethod::AddEvent, WorkerPayload::Empty))
            .unwrap();

        assert_eq!(finish.await.unwrap(), WorkerPayload::Bytes(vec![1, 2]));
        assert_eq!(add.await.unwrap(), WorkerPayload::Empty);
        assert!(handler.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_call_rejects() {
        let (handler, _channel, events) = stub_handler();
        let call = handler.post_message(WorkerMethod::AddEvent, Some("{}".to_string()));

        events
            .send(WorkerEvent::Message(WorkerResponse {
                id: Some(0),
                method: WorkerMethod::AddEvent,
                success: false,
                response: WorkerPayload::Error("boom".to_string()),
            }))
            .unwrap();

        assert_eq!(call.await, Err(WorkerError::Failed("boom".to_string())));
    }

    #[tokio::test]
    async fn test_ensure_ready_is_memoized() {
        let (handler, _channel, events) = stub_handler();
        events.send(ready_signal()).unwrap();

        handler.ensure_ready().await.unwrap();
        // A later error does not change the outcome
        events.send(WorkerEvent::Error("late".to_string())).unwrap();
        handler.ensure_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_ready_fails_on_worker_error() {
        let (handler, _channel, events) = stub_handler();
        events.send(WorkerEvent::Error("failed to load".to_string())).unwrap();

        assert_eq!(
            handler.ensure_ready().await,
            Err(WorkerError::NotReady("failed to load".to_string()))
        );
    }

    #[tokio::test]
    async fn test_closed_channel_fails_pending_calls() {
        let (handler, _channel, events) = stub_handler();
        let call = handler.post_message(WorkerMethod::Finish, None);
        drop(events);

        assert_eq!(call.await, Err(WorkerError::Terminated));
        assert!(handler.ensure_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_post_after_destroy_fails() {
        let (handler, channel, _events) = stub_handler();
        handler.destroy();

        assert!(channel.terminated.load(Ordering::SeqCst));
        let result = handler.post_message(WorkerMethod::Clear, None).await;
        assert_eq!(result, Err(WorkerError::Terminated));
    }
}
