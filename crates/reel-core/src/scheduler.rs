//! Debounced invocation of an async callback
//!
//! `schedule()` (re)arms a single timer that fires `wait` after the latest
//! call, but never later than `max_wait` after the first call of the burst.
//! `flush()` runs a pending invocation right away, `cancel()` drops it.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type DebouncedCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

type Invocation = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct DebounceState {
    first_call: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced, so a superseded timer that
    /// already woke up does nothing
    generation: u64,
    last: Option<Invocation>,
}

#[derive(Clone)]
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    callback: DebouncedCallback,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(wait: Duration, max_wait: Duration, callback: DebouncedCallback) -> Self {
        Self {
            wait,
            max_wait,
            callback,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Arm (or re-arm) the timer
    pub fn schedule(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let first_call = *state.first_call.get_or_insert(now);
        let deadline = (now + self.wait).min(first_call + self.max_wait);

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let debouncer = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut state = debouncer.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            debouncer.invoke(&mut state);
        }));
    }

    /// Whether an invocation is scheduled
    pub fn is_pending(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.first_call = None;
    }

    /// Run a pending invocation now and wait for it; without one, wait for
    /// the last invocation (if any)
    pub fn flush(&self) -> BoxFuture<'static, ()> {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
            state.generation += 1;
            self.invoke(&mut state);
        }
        match state.last.clone() {
            Some(last) => last.boxed(),
            None => futures_util::future::ready(()).boxed(),
        }
    }

    fn invoke(&self, state: &mut DebounceState) {
        state.first_call = None;
        let running = tokio::spawn((self.callback)());
        state.last = Some(running.map(|_| ()).boxed().shared());
    }
}
