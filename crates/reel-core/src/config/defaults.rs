//! Default configuration values
//!
//! All durations are in milliseconds.

/// Pause recording after this much user inactivity (5 minutes)
pub const SESSION_IDLE_PAUSE_DURATION: u64 = 300_000;

/// Replace the session after this much user inactivity (15 minutes)
pub const SESSION_IDLE_EXPIRE_DURATION: u64 = 900_000;

/// Debounced flush waits at least this long after the last update
pub const DEFAULT_FLUSH_MIN_DELAY: u64 = 5_000;

/// Debounced flush never waits longer than this after the first update
pub const DEFAULT_FLUSH_MAX_DELAY: u64 = 5_500;

/// Hard cap on the serialized size of buffered events
pub const REPLAY_MAX_EVENT_BUFFER_SIZE: usize = 20_000_000;

/// Shortest replay that is worth sending
pub const MIN_REPLAY_DURATION: u64 = 4_999;

/// Upper bound accepted for `min_replay_duration`
pub const MIN_REPLAY_DURATION_LIMIT: u64 = 15_000;

/// Longest a single replay may run (1 hour)
pub const MAX_REPLAY_DURATION: u64 = 3_600_000;

/// Flush grace period on top of `max_replay_duration`
pub const MAX_REPLAY_DURATION_FLUSH_GRACE: u64 = 5_000;

/// Segments whose context started this long past `max_replay_duration` are refused
pub const MAX_REPLAY_DURATION_SEND_GRACE: u64 = 30_000;

/// First retry delay for segment delivery
pub const RETRY_BASE_INTERVAL: u64 = 5_000;

/// Number of delivery retries before giving up
pub const RETRY_MAX_COUNT: u32 = 3;

/// Mutation batches above this size stop the replay
pub const DEFAULT_MUTATION_LIMIT: usize = 10_000;

/// Mutation batches above this size emit a `replay.mutations` breadcrumb
pub const DEFAULT_MUTATION_BREADCRUMB_LIMIT: usize = 750;

/// A click without follow-up for this long is a slow click
pub const DEFAULT_SLOW_CLICK_TIMEOUT: u64 = 7_000;

/// A mutation within this window after a click counts as a response
pub const SLOW_CLICK_THRESHOLD: u64 = 3_000;

/// A scroll within this window after a click counts as a response
pub const SLOW_CLICK_SCROLL_TIMEOUT: u64 = 300;

/// Full snapshot interval while buffering (1 minute)
pub const BUFFER_CHECKOUT_TIME: u64 = 60_000;

/// Interval between click detector sweeps
pub const CLICK_CHECK_INTERVAL: u64 = 1_000;

/// Max events accepted by `throttled_add_event` per window
pub const THROTTLE_MAX_COUNT: usize = 300;

/// Throttle window in seconds
pub const THROTTLE_DURATION_SECONDS: u64 = 5;

/// Max error / trace ids linked to a single segment
pub const MAX_LINKED_IDS: usize = 100;

/// Key under which sticky sessions are persisted
pub const REPLAY_SESSION_KEY: &str = "sentryReplaySession";

/// Item type of the replay metadata event
pub const REPLAY_EVENT_NAME: &str = "replay_event";

/// Message of the error raised when delivery fails
pub const UNABLE_TO_SEND_REPLAY: &str = "Unable to send Replay";
