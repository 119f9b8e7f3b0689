//! Replay orchestration
//!
//! [`ReplayContainer`] ties everything together: it owns the session, the
//! event buffer and the click detector, drives the recorder, and flushes
//! segments through the [`ReplaySender`].
//!
//! A replay runs in one of two modes:
//!
//! - **session**: every update schedules a debounced flush and segments are
//!   sent continuously
//! - **buffer**: the most recent events are kept (the buffer is reset on
//!   every checkout) and only sent when an error promotes the replay to
//!   session mode
//!
//! Container state lives behind one `parking_lot` mutex that is never held
//! across an await point or while calling out to the recorder, the buffer
//! or the sinks.

mod context;
mod handlers;
mod recorder;

pub use context::ReplayContext;
pub use handlers::{ErrorEvent, KeyModifiers, KeyboardEvent};
pub use recorder::{RecordOptions, Recorder, RecordingEmitter};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::buffer::{create_event_buffer, BufferError, BufferKind, EventBuffer};
use crate::click::{self, BreadcrumbSink, ClickDetector};
use crate::clock::Clock;
use crate::config::defaults::{
    BUFFER_CHECKOUT_TIME, MAX_REPLAY_DURATION_FLUSH_GRACE, MAX_REPLAY_DURATION_SEND_GRACE,
    THROTTLE_DURATION_SECONDS, THROTTLE_MAX_COUNT,
};
use crate::config::ReplayConfig;
use crate::delivery::{
    Dsn, EventProcessor, ReplaySender, Segment, SegmentContext, Transport, REPLAY_CATEGORY,
};
use crate::error::ReplayError;
use crate::events::{EventSink, NoOpEventSink};
use crate::recording::{Breadcrumb, RecordingEvent};
use crate::scheduler::Debouncer;
use crate::session::{self, Sampled, Session, SessionOptions, SessionTimeouts};
use crate::storage::{MemorySessionStore, SessionStore};
use crate::throttle::{Throttle, ThrottleDecision};

/// Whether segments are sent continuously or only on error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingMode {
    #[default]
    Session,
    Buffer,
}

impl RecordingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingMode::Session => "session",
            RecordingMode::Buffer => "buffer",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Send what is buffered before tearing down
    pub force_flush: bool,
    pub reason: Option<String>,
}

impl StopOptions {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            force_flush: false,
            reason: Some(reason.into()),
        }
    }

    pub fn with_force_flush(mut self) -> Self {
        self.force_flush = true;
        self
    }
}

#[derive(Default)]
struct ReplayState {
    session: Option<Session>,
    recording_mode: RecordingMode,
    is_enabled: bool,
    is_paused: bool,
    /// Recorder currently running
    is_recording: bool,
    requires_manual_start: bool,
    /// Epoch ms of the last user interaction
    last_activity: u64,
    context: ReplayContext,
    event_buffer: Option<Arc<dyn EventBuffer>>,
    flush_lock: Option<Shared<BoxFuture<'static, ()>>>,
    throttle: Option<Throttle>,
    current_url: Option<String>,
}

pub(crate) struct ReplayInner {
    config: ReplayConfig,
    clock: Clock,
    store: Arc<dyn SessionStore>,
    recorder: Arc<dyn Recorder>,
    sender: ReplaySender,
    sink: Arc<dyn EventSink>,
    debouncer: Debouncer,
    click_detector: Option<ClickDetector>,
    state: Mutex<ReplayState>,
    capturing_exception: AtomicBool,
    weak_self: Weak<ReplayInner>,
}

/// Builder for [`ReplayContainer`]
pub struct ReplayBuilder {
    config: ReplayConfig,
    recorder: Arc<dyn Recorder>,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn SessionStore>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Clock>,
    dsn: Option<Dsn>,
    tunnel: bool,
    event_processor: Option<Arc<dyn EventProcessor>>,
    url: Option<String>,
}

impl ReplayBuilder {
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dsn(mut self, dsn: Dsn) -> Self {
        self.dsn = Some(dsn);
        self
    }

    pub fn tunnel(mut self, tunnel: bool) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn event_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.event_processor = Some(processor);
        self
    }

    /// Page URL recorded as the initial URL of each segment
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn build(self) -> ReplayContainer {
        let config = self.config.normalized();
        let clock = self.clock.unwrap_or_default();
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let mut sender = ReplaySender::new(self.transport, clock)
            .with_tunnel(self.tunnel)
            .with_sink(sink.clone())
            .with_capture_exceptions(config.experiments.capture_exceptions);
        if let Some(dsn) = self.dsn {
            sender = sender.with_dsn(dsn);
        }
        if let Some(processor) = self.event_processor {
            sender = sender.with_event_processor(processor);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<ReplayInner>| {
            let flush_target = weak.clone();
            let debouncer = Debouncer::new(
                Duration::from_millis(config.flush_min_delay),
                Duration::from_millis(config.flush_max_delay),
                Arc::new(move || {
                    let replay = flush_target.clone();
                    async move {
                        if let Some(replay) = replay.upgrade() {
                            replay.flush_segment(false).await;
                        }
                    }
                    .boxed()
                }),
            );

            let click_detector = config.slow_click().map(|slow_click| {
                let sink: Arc<dyn BreadcrumbSink> = Arc::new(DetectorBreadcrumbs {
                    replay: weak.clone(),
                });
                ClickDetector::new(slow_click, clock, sink)
            });

            ReplayInner {
                config,
                clock,
                store,
                recorder: self.recorder,
                sender,
                sink,
                debouncer,
                click_detector,
                state: Mutex::new(ReplayState {
                    last_activity: clock.now_ms(),
                    current_url: self.url,
                    ..Default::default()
                }),
                capturing_exception: AtomicBool::new(false),
                weak_self: weak.clone(),
            }
        });

        ReplayContainer { inner }
    }
}

/// Reports click detector breadcrumbs into the replay
struct DetectorBreadcrumbs {
    replay: Weak<ReplayInner>,
}

impl BreadcrumbSink for DetectorBreadcrumbs {
    fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if let Some(replay) = self.replay.upgrade() {
            replay.add_breadcrumb(breadcrumb);
        }
    }

    fn current_url(&self) -> Option<String> {
        let replay = self.replay.upgrade()?;
        let url = replay.state.lock().current_url.clone();
        url
    }
}

/// A session replay
///
/// Cheap to clone; clones share the same replay.
#[derive(Clone)]
pub struct ReplayContainer {
    inner: Arc<ReplayInner>,
}

impl ReplayContainer {
    pub fn builder(
        config: ReplayConfig,
        recorder: Arc<dyn Recorder>,
        transport: Arc<dyn Transport>,
    ) -> ReplayBuilder {
        ReplayBuilder {
            config,
            recorder,
            transport,
            store: None,
            sink: None,
            clock: None,
            dsn: None,
            tunnel: false,
            event_processor: None,
            url: None,
        }
    }

    /// Sample a session and start recording if it was sampled
    pub fn initialize_sampling(&self, previous_session_id: Option<String>) {
        self.inner.initialize_sampling(previous_session_id);
    }

    /// Start recording in session mode, regardless of sampling
    pub fn start(&self) {
        self.inner.start();
    }

    /// Start recording in buffer mode, regardless of sampling
    pub fn start_buffering(&self) {
        self.inner.start_buffering();
    }

    pub async fn stop(&self, options: StopOptions) {
        self.inner.stop(options).await;
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Schedule a debounced flush
    pub fn flush(&self) {
        self.inner.debouncer.schedule();
    }

    /// Flush now and wait for the flush to complete
    pub async fn flush_immediate(&self) {
        self.inner.flush_immediate().await;
    }

    pub fn cancel_flush(&self) {
        self.inner.debouncer.cancel();
    }

    /// Flush now unless buffering
    pub async fn conditional_flush(&self) {
        self.inner.conditional_flush().await;
    }

    /// In buffer mode send the buffer and switch to session mode (unless
    /// `continue_recording` is false); in session mode just flush
    pub async fn send_buffered_replay_or_flush(&self, continue_recording: bool) {
        self.inner
            .send_buffered_replay_or_flush(continue_recording)
            .await;
    }

    /// Run `update`; unless it returns `true`, schedule a flush
    pub fn add_update(&self, update: impl FnOnce() -> bool) {
        self.inner.add_update(update);
    }

    /// Record a user interaction, resuming or refreshing as needed
    pub fn trigger_user_activity(&self) {
        self.inner.trigger_user_activity();
    }

    /// Record a user interaction without resuming
    pub fn update_user_activity(&self) {
        self.inner.update_user_activity();
    }

    /// Pause on idle, refresh on expiry; returns whether the session is usable
    pub fn check_and_handle_expired_session(&self) -> bool {
        self.inner.check_and_handle_expired_session()
    }

    /// Reset the context for a new segment
    pub fn set_initial_state(&self) {
        self.inner.set_initial_state();
    }

    pub fn throttled_add_event(&self, event: RecordingEvent, is_checkout: bool) -> ThrottleDecision {
        self.inner.throttled_add_event(event, is_checkout)
    }

    pub fn handle_exception(&self, error: &ReplayError) {
        self.inner.handle_exception(error);
    }

    pub fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        self.inner.add_breadcrumb(breadcrumb);
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.lock().session.clone()
    }

    pub fn recording_mode(&self) -> RecordingMode {
        self.inner.state.lock().recording_mode
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().is_enabled
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().is_paused
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().is_recording
    }

    pub fn replay_id(&self) -> Option<String> {
        self.inner.replay_id()
    }

    pub fn context(&self) -> ReplayContext {
        self.inner.state.lock().context.clone()
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.inner.config
    }

    /// Backend of the current event buffer
    pub fn buffer_kind(&self) -> Option<BufferKind> {
        let buffer = self.inner.state.lock().event_buffer.clone();
        buffer.map(|buffer| buffer.kind())
    }

    pub fn click_detector(&self) -> Option<&ClickDetector> {
        self.inner.click_detector.as_ref()
    }
}

impl ReplayInner {
    fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            session_idle_expire: self.config.session_idle_expire,
            max_replay_duration: self.config.max_replay_duration,
        }
    }

    fn replay_id(&self) -> Option<String> {
        self.state.lock().session.as_ref().map(|s| s.id.clone())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().is_enabled
    }

    fn notify(&self, result: Result<(), String>) {
        if let Err(e) = result {
            tracing::debug!("Event sink error: {e}");
        }
    }

    // Lifecycle

    fn initialize_sampling(&self, previous_session_id: Option<String>) {
        if self.config.requires_manual_start() {
            self.state.lock().requires_manual_start = true;
            return;
        }

        let options = SessionOptions {
            sticky_session: self.config.sticky_session,
            session_sample_rate: self.config.session_sample_rate,
            allow_buffering: self.config.error_sample_rate > 0.0,
        };
        let session = session::load_or_create_session(
            self.store.as_ref(),
            &self.timeouts(),
            &options,
            self.clock.now_ms(),
            previous_session_id,
        );

        let sampled = session.sampled;
        let mode = if sampled == Sampled::Buffer && session.segment_id == 0 {
            RecordingMode::Buffer
        } else {
            RecordingMode::Session
        };
        {
            let mut state = self.state.lock();
            state.session = Some(session);
            if !sampled.is_sampled() {
                return;
            }
            state.recording_mode = mode;
        }

        tracing::info!("Starting replay in {mode} mode");
        self.initialize_recording();
    }

    fn start(&self) {
        let now = self.clock.now_ms();
        {
            let state = self.state.lock();
            if state.is_enabled {
                match state.recording_mode {
                    RecordingMode::Session => tracing::info!("Recording is already in progress"),
                    RecordingMode::Buffer => {
                        tracing::info!("Buffering is in progress, call `flush()` to save the replay")
                    }
                }
                return;
            }
        }

        tracing::info!("Starting replay in session mode");
        let options = SessionOptions {
            sticky_session: self.config.sticky_session,
            session_sample_rate: 1.0,
            allow_buffering: false,
        };
        let session =
            session::load_or_create_session(self.store.as_ref(), &self.timeouts(), &options, now, None);
        {
            let mut state = self.state.lock();
            state.last_activity = now;
            state.session = Some(session);
            state.recording_mode = RecordingMode::Session;
        }
        self.initialize_recording();
    }

    fn start_buffering(&self) {
        if self.is_enabled() {
            tracing::info!("Buffering is in progress, call `flush()` to save the replay");
            return;
        }

        tracing::info!("Starting replay in buffer mode");
        let options = SessionOptions {
            sticky_session: self.config.sticky_session,
            session_sample_rate: 0.0,
            allow_buffering: true,
        };
        let session = session::load_or_create_session(
            self.store.as_ref(),
            &self.timeouts(),
            &options,
            self.clock.now_ms(),
            None,
        );
        {
            let mut state = self.state.lock();
            state.session = Some(session);
            state.recording_mode = RecordingMode::Buffer;
        }
        self.initialize_recording();
    }

    fn initialize_recording(&self) {
        self.set_initial_state();
        self.update_session_activity(self.clock.now_ms());

        let buffer = create_event_buffer(&self.config);
        self.remove_listeners();
        self.add_listeners();

        let (replay_id, mode) = {
            let mut state = self.state.lock();
            state.event_buffer = Some(buffer);
            state.throttle = Some(Throttle::new(THROTTLE_MAX_COUNT, THROTTLE_DURATION_SECONDS));
            state.is_enabled = true;
            state.is_paused = false;
            (
                state.session.as_ref().map(|s| s.id.clone()).unwrap_or_default(),
                state.recording_mode,
            )
        };

        self.start_recording();
        self.notify(self.sink.emit_replay_started(&replay_id, mode.as_str()));
    }

    fn start_recording(&self) {
        let options = RecordOptions {
            checkout_every_ms: (self.state.lock().recording_mode == RecordingMode::Buffer)
                .then_some(BUFFER_CHECKOUT_TIME),
        };

        self.state.lock().is_recording = true;
        let emitter = RecordingEmitter::new(self.weak_self.clone());
        if let Err(e) = self.recorder.start(emitter, options) {
            self.state.lock().is_recording = false;
            self.handle_exception(&e);
        }
    }

    /// Returns whether the recorder was stopped cleanly
    fn stop_recording(&self) -> bool {
        let was_recording = std::mem::replace(&mut self.state.lock().is_recording, false);
        if !was_recording {
            return true;
        }
        match self.recorder.stop() {
            Ok(()) => true,
            Err(e) => {
                self.handle_exception(&e);
                false
            }
        }
    }

    fn add_listeners(&self) {
        if let Some(detector) = &self.click_detector {
            detector.add_listeners();
        }
    }

    fn remove_listeners(&self) {
        if let Some(detector) = &self.click_detector {
            detector.remove_listeners();
        }
    }

    async fn stop(&self, options: StopOptions) {
        let reason = options.reason.unwrap_or_default();
        if !self.begin_stop(&reason) {
            return;
        }
        if options.force_flush {
            if let Some(replay) = self.weak_self.upgrade() {
                replay.flush_segment(true).await;
            }
        }
        self.finish_stop(&reason);
    }

    /// Stop without flushing
    fn stop_now(&self, reason: &str) {
        if self.begin_stop(reason) {
            self.finish_stop(reason);
        }
    }

    /// Disable the replay and tear down recording; `false` if already stopped
    fn begin_stop(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_enabled {
                return false;
            }
            state.is_enabled = false;
        }

        if reason.is_empty() {
            tracing::info!("Stopping Replay");
        } else {
            tracing::info!("Stopping Replay triggered by {reason}");
        }
        self.remove_listeners();
        self.stop_recording();
        self.debouncer.cancel();
        true
    }

    fn finish_stop(&self, reason: &str) {
        let (buffer, session) = {
            let mut state = self.state.lock();
            (state.event_buffer.take(), state.session.take())
        };
        if let Some(buffer) = buffer {
            buffer.destroy();
        }
        session::delete_session(self.store.as_ref());

        let replay_id = session.map(|s| s.id).unwrap_or_default();
        self.notify(self.sink.emit_replay_stopped(&replay_id, reason));
    }

    fn pause(&self) {
        {
            let mut state = self.state.lock();
            if state.is_paused {
                return;
            }
            state.is_paused = true;
        }
        self.stop_recording();
        tracing::info!("Pausing replay");
    }

    fn resume(&self) {
        let is_paused = self.state.lock().is_paused;
        if !is_paused || !self.check_session() {
            return;
        }
        self.state.lock().is_paused = false;
        self.start_recording();
        tracing::info!("Resuming replay");
    }

    // Session handling

    fn check_and_handle_expired_session(&self) -> bool {
        let now = self.clock.now_ms();
        let idle = {
            let state = self.state.lock();
            state.last_activity > 0
                && session::is_expired(state.last_activity, self.config.session_idle_pause, now)
                && state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.sampled == Sampled::Session)
        };
        if idle {
            self.pause();
            return false;
        }

        self.check_session()
    }

    /// `false` (and a refresh) if the session must be replaced
    fn check_session(&self) -> bool {
        let Some(current) = self.state.lock().session.clone() else {
            return false;
        };

        if current.should_refresh(&self.timeouts(), self.clock.now_ms()) {
            self.refresh_session(current.id);
            return false;
        }
        true
    }

    fn refresh_session(&self, previous_session_id: String) {
        if !self.is_enabled() {
            return;
        }
        self.stop_now("refresh session");
        self.initialize_sampling(Some(previous_session_id));
    }

    fn trigger_user_activity(&self) {
        let now = self.clock.now_ms();
        let is_recording = {
            let mut state = self.state.lock();
            state.last_activity = now;
            state.is_recording
        };

        if !is_recording {
            if !self.check_session() {
                return;
            }
            self.resume();
            return;
        }

        self.check_and_handle_expired_session();
        self.update_session_activity(now);
    }

    fn update_user_activity(&self) {
        let now = self.clock.now_ms();
        self.state.lock().last_activity = now;
        self.update_session_activity(now);
    }

    fn update_session_activity(&self, timestamp: u64) {
        let mut state = self.state.lock();
        if let Some(session) = state.session.as_mut() {
            session.last_activity = timestamp;
        }
        drop(state);
        self.maybe_save_session();
    }

    fn maybe_save_session(&self) {
        if !self.config.sticky_session {
            return;
        }
        let session = self.state.lock().session.clone();
        if let Some(session) = session {
            session::save_session(self.store.as_ref(), &session);
        }
    }

    fn set_initial_state(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let url = state.current_url.clone().unwrap_or_default();

        state.context.clear();
        state.context.initial_timestamp = now;
        state.context.initial_url = url.clone();
        if !url.is_empty() {
            state.context.add_url(url);
        }
    }

    // Events

    fn add_update(&self, update: impl FnOnce() -> bool) {
        let skip = update();

        let schedule = {
            let state = self.state.lock();
            state.recording_mode != RecordingMode::Buffer && state.is_enabled
        };
        if schedule && !skip {
            self.debouncer.schedule();
        }
    }

    fn handle_recording_event(self: &Arc<Self>, event: RecordingEvent, is_checkout: bool) {
        if let Some(detector) = &self.click_detector {
            click::update_for_recording_event(detector, &event, |id| self.recorder.node(id));
        }

        self.add_update(|| {
            let mode = self.state.lock().recording_mode;
            if mode == RecordingMode::Buffer && is_checkout {
                self.set_initial_state();
            }

            if !self.add_event_sync(&event, is_checkout) {
                return true;
            }
            if !is_checkout {
                return false;
            }

            self.add_settings_event();

            let (previous_session_id, buffer) = {
                let state = self.state.lock();
                (
                    state
                        .session
                        .as_ref()
                        .and_then(|s| s.previous_session_id.clone()),
                    state.event_buffer.clone(),
                )
            };
            // A session created on expiry waits for user activity before sending
            if previous_session_id.is_some() {
                return true;
            }

            let mode = self.state.lock().recording_mode;
            if mode == RecordingMode::Buffer {
                if let Some(earliest) = buffer.and_then(|b| b.earliest_timestamp()) {
                    tracing::debug!("Updating session start time to earliest event in buffer");
                    if let Some(session) = self.state.lock().session.as_mut() {
                        session.started = earliest;
                    }
                    self.maybe_save_session();
                }
            }

            if mode == RecordingMode::Session {
                self.debouncer.schedule();
            }
            true
        });
    }

    /// `options` custom event describing the replay setup, first segment only
    fn add_settings_event(&self) {
        let (segment_id, buffer_kind) = {
            let state = self.state.lock();
            (
                state.session.as_ref().map(|s| s.segment_id),
                state.event_buffer.as_ref().map(|b| b.kind()),
            )
        };
        if segment_id != Some(0) {
            return;
        }

        let payload = json!({
            "sessionSampleRate": self.config.session_sample_rate,
            "errorSampleRate": self.config.error_sample_rate,
            "useCompressionOption": self.config.use_compression,
            "useCompression": buffer_kind == Some(BufferKind::Worker),
            "slowClickTimeout": self.config.slow_click_timeout,
            "mutationLimit": self.config.mutation_limit,
            "mutationBreadcrumbLimit": self.config.mutation_breadcrumb_limit,
        });
        let event = RecordingEvent::custom("options", self.clock.now_ms(), payload);
        self.add_event_sync(&event, false);
    }

    fn should_add_event(&self, event: &RecordingEvent) -> bool {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        if state.event_buffer.is_none() || state.is_paused || !state.is_enabled {
            return false;
        }

        if event.timestamp.saturating_add(self.config.session_idle_pause) < now {
            return false;
        }

        if event.timestamp
            > state
                .context
                .initial_timestamp
                .saturating_add(self.config.max_replay_duration)
        {
            tracing::info!(
                timestamp = event.timestamp,
                "Skipping event with timestamp because it is after maxReplayDuration"
            );
            return false;
        }
        true
    }

    /// Queue an event if it is admissible; `false` if it was dropped
    fn add_event_sync(&self, event: &RecordingEvent, is_checkout: bool) -> bool {
        if !self.should_add_event(event) {
            return false;
        }
        self.add_event(event, is_checkout);
        true
    }

    fn add_event(&self, event: &RecordingEvent, is_checkout: bool) {
        let (buffer, mode) = {
            let state = self.state.lock();
            let Some(buffer) = state.event_buffer.clone() else {
                return;
            };
            (buffer, state.recording_mode)
        };

        if buffer.wait_for_checkout() && !is_checkout {
            return;
        }
        if is_checkout && mode == RecordingMode::Buffer {
            buffer.clear();
        }
        if is_checkout {
            buffer.set_has_checkout(true);
            buffer.set_wait_for_checkout(false);
        }

        let mut pending = buffer.add_event(event);
        match (&mut pending).now_or_never() {
            Some(result) => self.handle_add_event_result(result, &buffer),
            None => {
                let replay = self.weak_self.clone();
                tokio::spawn(async move {
                    let result = pending.await;
                    if let Some(replay) = replay.upgrade() {
                        replay.handle_add_event_result(result, &buffer);
                    }
                });
            }
        }
    }

    fn handle_add_event_result(&self, result: Result<(), BufferError>, buffer: &Arc<dyn EventBuffer>) {
        let Err(error) = result else {
            return;
        };

        let exceeded = error == BufferError::SizeExceeded;
        if exceeded && self.state.lock().recording_mode == RecordingMode::Buffer {
            // Start over from the next full snapshot
            buffer.clear();
            buffer.set_wait_for_checkout(true);
            return;
        }

        let reason = if exceeded {
            "addEventSizeExceeded"
        } else {
            "addEvent"
        };
        self.handle_exception(&error.into());
        self.stop_now(reason);
        self.notify(self.sink.emit_dropped_event("internal_sdk_error", REPLAY_CATEGORY));
    }

    fn throttled_add_event(&self, event: RecordingEvent, is_checkout: bool) -> ThrottleDecision {
        let now = self.clock.now_ms();
        let decision = match self.state.lock().throttle.as_mut() {
            Some(throttle) => throttle.check(now),
            None => ThrottleDecision::Allowed,
        };

        match decision {
            ThrottleDecision::Allowed => {
                self.add_event_sync(&event, is_checkout);
            }
            ThrottleDecision::Throttled => {
                let breadcrumb = Breadcrumb::new("replay.throttled", self.clock.now_secs());
                let mut event = RecordingEvent::breadcrumb(&breadcrumb);
                if let Value::Object(data) = &mut event.data {
                    data.insert("metric".to_string(), Value::Bool(true));
                }
                self.add_update(|| !self.add_event_sync(&event, false));
            }
            ThrottleDecision::Skipped => {}
        }
        decision
    }

    fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if breadcrumb.category == "sentry.transaction" {
            return;
        }

        if matches!(breadcrumb.category.as_str(), "ui.click" | "ui.input") {
            self.trigger_user_activity();
        } else {
            self.check_and_handle_expired_session();
        }

        self.add_update(|| {
            self.throttled_add_event(RecordingEvent::breadcrumb(&breadcrumb), false);
            breadcrumb.category == "console"
        });
    }

    /// Breadcrumb recorded without touching user activity
    fn create_custom_breadcrumb(&self, breadcrumb: Breadcrumb) {
        self.add_update(|| {
            self.throttled_add_event(RecordingEvent::breadcrumb(&breadcrumb), false);
            false
        });
    }

    fn handle_mutation(self: &Arc<Self>, count: usize) -> bool {
        let limit = self.config.mutation_limit;
        let over_limit = limit > 0 && count > limit;

        if count > self.config.mutation_breadcrumb_limit || over_limit {
            let breadcrumb = Breadcrumb::new("replay.mutations", self.clock.now_secs())
                .with_data("count", count)
                .with_data("limit", over_limit);
            self.create_custom_breadcrumb(breadcrumb);
        }

        if !over_limit {
            return true;
        }

        let force_flush = self.state.lock().recording_mode == RecordingMode::Session;
        if self.begin_stop("mutationLimit") {
            let replay = self.clone();
            tokio::spawn(async move {
                if force_flush {
                    replay.clone().flush_segment(true).await;
                }
                replay.finish_stop("mutationLimit");
            });
        }
        false
    }

    // Flushing

    fn flush_immediate(&self) -> BoxFuture<'static, ()> {
        self.debouncer.schedule();
        self.debouncer.flush()
    }

    async fn conditional_flush(&self) {
        if self.state.lock().recording_mode == RecordingMode::Buffer {
            return;
        }
        self.flush_immediate().await;
    }

    async fn send_buffered_replay_or_flush(&self, continue_recording: bool) {
        if self.state.lock().recording_mode == RecordingMode::Session {
            self.flush_immediate().await;
            return;
        }

        let activity_time = self.clock.now_ms();
        tracing::info!("Converting buffer to session");

        self.flush_immediate().await;

        let stopped = self.stop_recording();
        if !continue_recording || !stopped {
            return;
        }

        let has_session = {
            let mut state = self.state.lock();
            // Stopped or converted while flushing
            if state.recording_mode == RecordingMode::Session || !state.is_enabled {
                return;
            }
            state.recording_mode = RecordingMode::Session;
            state.last_activity = activity_time;
            state.session.is_some()
        };
        if has_session {
            self.update_session_activity(activity_time);
        }

        self.start_recording();
        if let Some(replay_id) = self.replay_id() {
            tracing::info!(replay_id = %replay_id, "Replay switched to session mode");
        }
    }

    /// Flush the current segment, serialized with any flush in flight
    async fn flush_segment(self: Arc<Self>, force: bool) {
        if !self.is_enabled() && !force {
            return;
        }

        if !self.check_and_handle_expired_session() {
            tracing::error!("Attempting to finish replay event after session expired");
            return;
        }

        let Some(session) = self.state.lock().session.clone() else {
            return;
        };

        let duration = self.clock.now_ms().saturating_sub(session.started);
        self.debouncer.cancel();

        let too_short = duration < self.config.min_replay_duration;
        let too_long = duration
            > self
                .config
                .max_replay_duration
                .saturating_add(MAX_REPLAY_DURATION_FLUSH_GRACE);
        if too_short || too_long {
            tracing::info!(
                "Session duration ({}s) is too {}, not sending replay",
                duration / 1000,
                if too_short { "short" } else { "long" }
            );
            if too_short {
                self.debouncer.schedule();
            }
            return;
        }

        let (lock, in_progress) = {
            let mut state = self.state.lock();
            if session.segment_id == 0
                && state
                    .event_buffer
                    .as_ref()
                    .is_some_and(|buffer| !buffer.has_checkout())
            {
                tracing::info!("Flushing initial segment without checkout");
            }

            match &state.flush_lock {
                Some(lock) => (lock.clone(), true),
                None => {
                    let task = tokio::spawn(self.clone().run_flush());
                    let lock = task.map(|_| ()).boxed().shared();
                    state.flush_lock = Some(lock.clone());
                    (lock, false)
                }
            }
        };

        lock.clone().await;

        {
            let mut state = self.state.lock();
            if state
                .flush_lock
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&lock))
            {
                state.flush_lock = None;
            }
        }
        if in_progress {
            self.debouncer.schedule();
        }
    }

    async fn run_flush(self: Arc<Self>) {
        let prepared = {
            let mut state = self.state.lock();
            let (Some(session), Some(buffer)) = (state.session.as_ref(), state.event_buffer.clone())
            else {
                tracing::error!("No session or eventBuffer found to flush");
                return;
            };
            if !buffer.has_events() {
                return;
            }
            let replay_id = session.id.clone();

            // Buffered events may predate the segment start
            if !state.requires_manual_start {
                if let Some(earliest) = buffer.earliest_timestamp() {
                    if earliest < state.context.initial_timestamp {
                        state.context.initial_timestamp = earliest;
                    }
                }
            }

            let timestamp = self.clock.now_ms();
            if timestamp.saturating_sub(state.context.initial_timestamp)
                > self.config.max_replay_duration.saturating_add(MAX_REPLAY_DURATION_SEND_GRACE)
            {
                Err(ReplayError::SessionTooLong)
            } else {
                let context = state.context.pop();
                let session = state.session.as_mut().map(|session| {
                    let segment_id = session.segment_id;
                    session.segment_id += 1;
                    (segment_id, session.sampled)
                });
                match session {
                    Some((segment_id, replay_type)) => {
                        Ok((buffer, replay_id, segment_id, replay_type, context, timestamp))
                    }
                    None => return,
                }
            }
        };

        let result = match prepared {
            Ok((buffer, replay_id, segment_id, replay_type, context, timestamp)) => {
                self.maybe_save_session();
                self.deliver(buffer, replay_id, segment_id, replay_type, context, timestamp)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(error) = result {
            let reason = match &error {
                ReplayError::Send(send_error) => send_error.dropped_reason(),
                _ => "send_error",
            };
            self.handle_exception(&error);
            self.stop_now("sendReplay");
            self.notify(self.sink.emit_dropped_event(reason, REPLAY_CATEGORY));
        }
    }

    async fn deliver(
        &self,
        buffer: Arc<dyn EventBuffer>,
        replay_id: String,
        segment_id: u64,
        replay_type: Sampled,
        context: SegmentContext,
        timestamp: u64,
    ) -> Result<(), ReplayError> {
        let recording_data = buffer.finish().await?;
        let bytes = recording_data.len();

        let segment = Segment {
            recording_data,
            replay_id,
            segment_id,
            context,
            timestamp,
            replay_type,
        };

        let sent = self.sender.send_replay(&segment).await?;
        if sent {
            tracing::debug!(replay_id = %segment.replay_id, segment_id, bytes, "Sent replay segment");
            self.notify(self.sink.emit_segment_sent(&segment.replay_id, segment_id, bytes));
        }
        Ok(())
    }

    // Errors

    fn handle_exception(&self, error: &ReplayError) {
        tracing::error!("Encountered error: {error}");

        if !self.config.experiments.capture_exceptions {
            return;
        }
        // Capturing may itself fail and report back here
        if self.capturing_exception.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify(self.sink.capture_exception(error));
        self.capturing_exception.store(false, Ordering::SeqCst);
    }
}
