//! Event Sink Trait
//!
//! Lifecycle notifications from the replay pipeline go through an
//! [`EventSink`], so hosts can surface them however they like (stdout for
//! the CLI, nothing at all in embedded use, a collector in tests).

use serde_json::json;

use crate::error::ReplayError;

/// Receiver for replay lifecycle notifications
pub trait EventSink: Send + Sync {
    /// Recording started in `mode` ("session" or "buffer")
    fn emit_replay_started(&self, replay_id: &str, mode: &str) -> Result<(), String>;

    fn emit_replay_stopped(&self, replay_id: &str, reason: &str) -> Result<(), String>;

    /// A segment was accepted by the transport
    fn emit_segment_sent(&self, replay_id: &str, segment_id: u64, bytes: usize)
        -> Result<(), String>;

    /// Outcome for data that was dropped (`send_error`, `ratelimit_backoff`, ...)
    fn emit_dropped_event(&self, reason: &str, category: &str) -> Result<(), String>;

    /// Internal error forwarded when exception capture is enabled
    fn capture_exception(&self, error: &ReplayError) -> Result<(), String>;
}

/// No-op event sink for embedded use or tests
#[derive(Default, Clone)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit_replay_started(&self, _replay_id: &str, _mode: &str) -> Result<(), String> {
        Ok(())
    }

    fn emit_replay_stopped(&self, _replay_id: &str, _reason: &str) -> Result<(), String> {
        Ok(())
    }

    fn emit_segment_sent(
        &self,
        _replay_id: &str,
        _segment_id: u64,
        _bytes: usize,
    ) -> Result<(), String> {
        Ok(())
    }

    fn emit_dropped_event(&self, _reason: &str, _category: &str) -> Result<(), String> {
        Ok(())
    }

    fn capture_exception(&self, _error: &ReplayError) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    fn print(&self, json: serde_json::Value, text: String) {
        if self.json_output {
            println!("{json}");
        } else {
            println!("{text}");
        }
    }
}

impl EventSink for StdoutEventSink {
    fn emit_replay_started(&self, replay_id: &str, mode: &str) -> Result<(), String> {
        self.print(
            json!({"event": "replay_started", "replay_id": replay_id, "mode": mode}),
            format!("Replay started: {replay_id} ({mode})"),
        );
        Ok(())
    }

    fn emit_replay_stopped(&self, replay_id: &str, reason: &str) -> Result<(), String> {
        self.print(
            json!({"event": "replay_stopped", "replay_id": replay_id, "reason": reason}),
            format!("Replay stopped: {replay_id} ({reason})"),
        );
        Ok(())
    }

    fn emit_segment_sent(&self, replay_id: &str, segment_id: u64, bytes: usize) -> Result<(), String> {
        self.print(
            json!({
                "event": "segment_sent",
                "replay_id": replay_id,
                "segment_id": segment_id,
                "bytes": bytes,
            }),
            format!("Segment {segment_id} sent: {replay_id} ({})", format_bytes(bytes)),
        );
        Ok(())
    }

    fn emit_dropped_event(&self, reason: &str, category: &str) -> Result<(), String> {
        self.print(
            json!({"event": "dropped_event", "reason": reason, "category": category}),
            format!("Dropped {category}: {reason}"),
        );
        Ok(())
    }

    fn capture_exception(&self, error: &ReplayError) -> Result<(), String> {
        self.print(
            json!({"event": "exception", "message": error.to_string()}),
            format!("Exception: {error}"),
        );
        Ok(())
    }
}

fn format_bytes(bytes: usize) -> String {
    match bytes {
        0..=1023 => format!("{bytes} B"),
        1024..=1_048_575 => format!("{:.1} KiB", bytes as f64 / 1024.0),
        _ => format!("{:.1} MiB", bytes as f64 / 1_048_576.0),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records every notification as a short string
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub events: Mutex<Vec<String>>,
    }

    impl CollectingSink {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    impl EventSink for CollectingSink {
        fn emit_replay_started(&self, _replay_id: &str, mode: &str) -> Result<(), String> {
            self.events.lock().push(format!("started:{mode}"));
            Ok(())
        }

        fn emit_replay_stopped(&self, _replay_id: &str, reason: &str) -> Result<(), String> {
            self.events.lock().push(format!("stopped:{reason}"));
            Ok(())
        }

        fn emit_segment_sent(
            &self,
            _replay_id: &str,
            segment_id: u64,
            _bytes: usize,
        ) -> Result<(), String> {
            self.events.lock().push(format!("segment:{segment_id}"));
            Ok(())
        }

        fn emit_dropped_event(&self, reason: &str, category: &str) -> Result<(), String> {
            self.events.lock().push(format!("dropped:{reason}:{category}"));
            Ok(())
        }

        fn capture_exception(&self, error: &ReplayError) -> Result<(), String> {
            self.events.lock().push(format!("exception:{error}"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink() {
        let sink = NoOpEventSink;
        assert!(sink.emit_replay_started("test", "session").is_ok());
        assert!(sink.emit_replay_stopped("test", "manual").is_ok());
        assert!(sink
            .capture_exception(&ReplayError::Other("boom".into()))
            .is_ok());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1_048_576), "3.0 MiB");
    }
}
