//! Message channels to a worker
//!
//! `WorkerHandler` only needs to post requests and receive events; where the
//! worker lives (an OS thread here, a stub in tests) is hidden behind
//! [`WorkerChannel`].

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use super::{compressor, WorkerError, WorkerEvent, WorkerRequest};

/// Outbound half of a worker connection
pub trait WorkerChannel: Send + Sync {
    /// Enqueue a request; must not block
    fn post(&self, request: WorkerRequest) -> Result<(), WorkerError>;

    /// Stop the worker; later posts fail
    fn terminate(&self);
}

/// Channel to a compression worker running on its own thread
pub struct ThreadWorkerChannel {
    sender: Mutex<Option<mpsc::Sender<WorkerRequest>>>,
}

impl ThreadWorkerChannel {
    /// Spawn the compression worker thread
    pub fn spawn() -> Result<(Arc<Self>, UnboundedReceiver<WorkerEvent>), WorkerError> {
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = unbounded_channel();

        thread::Builder::new()
            .name("reel-compression".to_string())
            .spawn(move || compressor::run(request_rx, event_tx))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        let channel = Arc::new(Self {
            sender: Mutex::new(Some(request_tx)),
        });
        Ok((channel, event_rx))
    }
}

impl WorkerChannel for ThreadWorkerChannel {
    fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(WorkerError::Terminated)?;
        sender.send(request).map_err(|_| WorkerError::Terminated)
    }

    fn terminate(&self) {
        // Dropping the sender ends the worker loop
        self.sender.lock().take();
    }
}
