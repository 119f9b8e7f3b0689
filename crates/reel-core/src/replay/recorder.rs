//! The recorder seam
//!
//! A [`Recorder`] observes the page and produces rrweb-shaped events. It hands
//! them to the [`RecordingEmitter`] it was started with. The replay drives
//! the recorder: it is started for every new recording (and to force a full
//! snapshot), and stopped when the replay pauses or stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::ReplayInner;
use crate::click::DomNode;
use crate::error::Result;
use crate::recording::{NodeId, RecordingEvent};

/// Options passed to the recorder on start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOptions {
    /// Take a full snapshot this often (ms); set while buffering
    pub checkout_every_ms: Option<u64>,
}

pub trait Recorder: Send + Sync {
    /// Begin recording; the first emitted event must be a full snapshot
    fn start(&self, emitter: RecordingEmitter, options: RecordOptions) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Resolve a node id from the recorder's mirror
    fn node(&self, _id: NodeId) -> Option<Arc<DomNode>> {
        None
    }
}

/// Handle a recorder uses to push events into the replay
///
/// The first event emitted through an emitter is always treated as a
/// checkout. Clones share that state.
#[derive(Clone)]
pub struct RecordingEmitter {
    replay: Weak<ReplayInner>,
    had_first_event: Arc<AtomicBool>,
}

impl RecordingEmitter {
    pub(crate) fn new(replay: Weak<ReplayInner>) -> Self {
        Self {
            replay,
            had_first_event: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emit(&self, event: RecordingEvent, is_checkout: bool) {
        let Some(replay) = self.replay.upgrade() else {
            return;
        };

        if !replay.check_and_handle_expired_session() {
            tracing::warn!("Received replay event after session expired");
            return;
        }

        let first = !self.had_first_event.swap(true, Ordering::SeqCst);
        replay.handle_recording_event(event, is_checkout || first);
    }

    /// Report a mutation batch of `count` records; `false` tells the
    /// recorder to drop the batch
    pub fn on_mutation(&self, count: usize) -> bool {
        match self.replay.upgrade() {
            Some(replay) => replay.handle_mutation(count),
            None => false,
        }
    }
}
