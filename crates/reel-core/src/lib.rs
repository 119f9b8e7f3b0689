//! Reel Core Library
//!
//! Session replay capture, buffering and delivery. A host feeds recorder
//! events and DOM signals into a [`ReplayContainer`]; the container keeps
//! session state, buffers events (optionally compressed off-thread) and
//! ships segments as envelopes through a [`Transport`].
//!
//! # Modules
//!
//! - [`replay`] - Replay container: sampling, recording modes, flushing
//! - [`session`] - Session lifecycle and sampling
//! - [`buffer`] - Event buffers (plain array, compression worker, proxy)
//! - [`worker`] - Compression worker RPC
//! - [`click`] - Slow and multi click detection
//! - [`delivery`] - Envelopes, transports, rate limits and retries
//! - [`recording`] - Recording event and breadcrumb types
//! - [`scheduler`] - Debounced flush scheduling
//! - [`throttle`] - Event rate limiting
//! - [`storage`] - Session persistence
//! - [`events`] - Event sink trait for lifecycle notifications
//! - [`config`] - Replay configuration
//! - [`error`] - Error types

pub mod buffer;
pub mod click;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod recording;
pub mod replay;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod throttle;
pub mod worker;

// Re-export commonly used types
pub use buffer::{create_event_buffer, BufferError, BufferKind, EventBuffer, RecordingData};
pub use click::{ClickDetector, DomNode};
pub use clock::Clock;
pub use config::ReplayConfig;
pub use delivery::{Dsn, Envelope, ReplaySender, SendReplayError, Transport, TransportError, TransportResponse};
pub use error::{ReplayError, Result};
pub use events::{EventSink, NoOpEventSink, StdoutEventSink};
pub use recording::{Breadcrumb, EventType, RecordingEvent};
pub use replay::{
    RecordOptions, Recorder, RecordingEmitter, RecordingMode, ReplayBuilder, ReplayContainer,
    StopOptions,
};
pub use session::{Sampled, Session};
pub use storage::{MemorySessionStore, SessionStore, SledSessionStore};
pub use worker::{WorkerError, WorkerHandler};

#[cfg(feature = "http")]
pub use delivery::HttpTransport;
