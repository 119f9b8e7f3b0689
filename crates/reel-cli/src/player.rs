//! JSONL playback
//!
//! Feeds a recorded event stream (one rrweb event per line) into a replay
//! as if it were being recorded live. Timestamps are rebased so the first
//! event happens now.

use parking_lot::Mutex;
use reel_core::recording::IncrementalSource;
use reel_core::{Clock, EventType, RecordOptions, Recorder, RecordingEmitter, RecordingEvent};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Read events from a JSONL file, skipping blank and malformed lines
pub fn load_events(path: &Path) -> Result<Vec<RecordingEvent>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordingEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("Skipping line {}: {e}", index + 1),
        }
    }

    if events.is_empty() {
        return Err(format!("No events found in {}", path.display()));
    }
    Ok(events)
}

#[derive(Default)]
struct PlayerState {
    emitter: Option<RecordingEmitter>,
    options: RecordOptions,
    /// Latest meta event and full snapshot, replayed on restart
    checkout: Vec<RecordingEvent>,
    last_checkout: u64,
}

/// Recorder backed by a pre-recorded event stream
pub struct JsonlRecorder {
    clock: Clock,
    state: Mutex<PlayerState>,
}

/// Outcome of a playback run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub emitted: usize,
    /// Dropped because the recorder was not running
    pub skipped: usize,
}

impl JsonlRecorder {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            state: Mutex::new(PlayerState::default()),
        }
    }

    /// Emit `events` in order
    ///
    /// With `speed > 0` the original spacing is kept, divided by `speed`;
    /// otherwise events are emitted as fast as possible.
    pub async fn play(&self, events: Vec<RecordingEvent>, speed: f64) -> PlaybackStats {
        let mut stats = PlaybackStats::default();
        let Some(base) = events.first().map(|event| event.timestamp) else {
            return stats;
        };
        let start = self.clock.now_ms();

        for mut event in events {
            let offset = event.timestamp.saturating_sub(base);
            if speed > 0.0 {
                let due = start.saturating_add((offset as f64 / speed) as u64);
                let now = self.clock.now_ms();
                if due > now {
                    tokio::time::sleep(Duration::from_millis(due - now)).await;
                }
            }
            event.timestamp = start.saturating_add(offset);

            let Some(emitter) = self.prepare(&event) else {
                stats.skipped += 1;
                continue;
            };

            if let Some(count) = mutation_count(&event) {
                if !emitter.on_mutation(count) {
                    stats.skipped += 1;
                    continue;
                }
            }

            emitter.emit(event, false);
            stats.emitted += 1;
        }

        stats
    }

    /// Track checkouts and take a periodic one if due; returns the live emitter
    fn prepare(&self, event: &RecordingEvent) -> Option<RecordingEmitter> {
        let (emitter, due) = {
            let mut state = self.state.lock();
            match event.event_type {
                EventType::Meta => {
                    state.checkout.clear();
                    state.checkout.push(event.clone());
                    state.last_checkout = event.timestamp;
                }
                EventType::FullSnapshot => {
                    state.checkout.retain(|e| e.event_type == EventType::Meta);
                    state.checkout.push(event.clone());
                    state.last_checkout = event.timestamp;
                }
                _ => {}
            }

            let emitter = state.emitter.clone()?;
            let due = match state.options.checkout_every_ms {
                Some(every) if event.timestamp.saturating_sub(state.last_checkout) >= every => {
                    state.last_checkout = event.timestamp;
                    state.checkout.clone()
                }
                _ => Vec::new(),
            };
            (emitter, due)
        };

        for (index, mut checkout) in due.into_iter().enumerate() {
            checkout.timestamp = event.timestamp;
            emitter.emit(checkout, index == 0);
        }
        Some(emitter)
    }
}

impl Recorder for JsonlRecorder {
    fn start(&self, emitter: RecordingEmitter, options: RecordOptions) -> reel_core::Result<()> {
        let now = self.clock.now_ms();
        let checkout = {
            let mut state = self.state.lock();
            state.emitter = Some(emitter.clone());
            state.options = options;
            state.last_checkout = now;
            state.checkout.clone()
        };

        // A restarted recorder begins with a fresh full snapshot
        for mut event in checkout {
            event.timestamp = now;
            emitter.emit(event, false);
        }
        Ok(())
    }

    fn stop(&self) -> reel_core::Result<()> {
        self.state.lock().emitter = None;
        Ok(())
    }
}

/// Number of records in a mutation event
fn mutation_count(event: &RecordingEvent) -> Option<usize> {
    if event.event_type != EventType::IncrementalSnapshot {
        return None;
    }
    let source = event.data.get("source").and_then(Value::as_u64)?;
    if source != IncrementalSource::Mutation.code() {
        return None;
    }

    let count = ["adds", "removes", "texts", "attributes"]
        .iter()
        .filter_map(|key| event.data.get(*key).and_then(Value::as_array))
        .map(Vec::len)
        .sum();
    Some(count)
}
