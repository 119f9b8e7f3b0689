use serde::{Deserialize, Serialize};

use super::defaults;

/// Replay configuration
///
/// Provides centralized configuration management with:
/// - Serde support for loading from JSON files (camelCase keys)
/// - Builder methods for customization
/// - Defaults matching the browser SDK
///
/// All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplayConfig {
    /// Fraction of sessions recorded from the start
    pub session_sample_rate: f64,

    /// Fraction of buffered sessions promoted when an error occurs
    pub error_sample_rate: f64,

    /// Persist session metadata so it survives reloads
    pub sticky_session: bool,

    /// Offload buffering to the compression worker
    pub use_compression: bool,

    /// Replays shorter than this are not sent
    pub min_replay_duration: u64,

    /// Replays longer than this are cut off
    pub max_replay_duration: u64,

    /// Idle time after which recording pauses
    pub session_idle_pause: u64,

    /// Idle time after which the session is replaced
    pub session_idle_expire: u64,

    /// Debounce wait for flushes
    pub flush_min_delay: u64,

    /// Max time a debounced flush can be postponed
    pub flush_max_delay: u64,

    /// Mutation batch size that stops the replay (0 disables)
    pub mutation_limit: usize,

    /// Mutation batch size that emits a breadcrumb
    pub mutation_breadcrumb_limit: usize,

    /// Slow click timeout; 0 disables slow click detection
    pub slow_click_timeout: u64,

    /// Selectors whose elements never produce slow clicks
    pub slow_click_ignore_selectors: Vec<String>,

    /// Hard cap on the serialized size of buffered events
    pub max_event_buffer_size: usize,

    /// Experimental switches
    pub experiments: Experiments,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Experiments {
    /// Forward internal replay errors to exception capture
    pub capture_exceptions: bool,
}

/// Slow click detection settings, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowClickConfig {
    pub threshold: u64,
    pub timeout: u64,
    pub scroll_timeout: u64,
    pub ignore_selector: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            session_sample_rate: 0.0,
            error_sample_rate: 0.0,
            sticky_session: true,
            use_compression: true,
            min_replay_duration: defaults::MIN_REPLAY_DURATION,
            max_replay_duration: defaults::MAX_REPLAY_DURATION,
            session_idle_pause: defaults::SESSION_IDLE_PAUSE_DURATION,
            session_idle_expire: defaults::SESSION_IDLE_EXPIRE_DURATION,
            flush_min_delay: defaults::DEFAULT_FLUSH_MIN_DELAY,
            flush_max_delay: defaults::DEFAULT_FLUSH_MAX_DELAY,
            mutation_limit: defaults::DEFAULT_MUTATION_LIMIT,
            mutation_breadcrumb_limit: defaults::DEFAULT_MUTATION_BREADCRUMB_LIMIT,
            slow_click_timeout: defaults::DEFAULT_SLOW_CLICK_TIMEOUT,
            slow_click_ignore_selectors: Vec::new(),
            max_event_buffer_size: defaults::REPLAY_MAX_EVENT_BUFFER_SIZE,
            experiments: Experiments::default(),
        }
    }
}

impl ReplayConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_sample_rate(mut self, rate: f64) -> Self {
        self.session_sample_rate = rate;
        self
    }

    pub fn with_error_sample_rate(mut self, rate: f64) -> Self {
        self.error_sample_rate = rate;
        self
    }

    pub fn with_sticky_session(mut self, sticky: bool) -> Self {
        self.sticky_session = sticky;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    pub fn with_min_replay_duration(mut self, ms: u64) -> Self {
        self.min_replay_duration = ms;
        self
    }

    pub fn with_max_replay_duration(mut self, ms: u64) -> Self {
        self.max_replay_duration = ms;
        self
    }

    pub fn with_slow_click_timeout(mut self, ms: u64) -> Self {
        self.slow_click_timeout = ms;
        self
    }

    pub fn with_slow_click_ignore_selectors(mut self, selectors: Vec<String>) -> Self {
        self.slow_click_ignore_selectors = selectors;
        self
    }

    pub fn with_max_event_buffer_size(mut self, bytes: usize) -> Self {
        self.max_event_buffer_size = bytes;
        self
    }

    pub fn with_experiments(mut self, experiments: Experiments) -> Self {
        self.experiments = experiments;
        self
    }

    /// Clamp values into their accepted ranges
    pub fn normalized(mut self) -> Self {
        self.session_sample_rate = clamp_rate(self.session_sample_rate);
        self.error_sample_rate = clamp_rate(self.error_sample_rate);
        self.min_replay_duration = self
            .min_replay_duration
            .min(defaults::MIN_REPLAY_DURATION_LIMIT);
        self.max_replay_duration = self.max_replay_duration.min(defaults::MAX_REPLAY_DURATION);
        self.flush_max_delay = self.flush_max_delay.max(self.flush_min_delay);
        self
    }

    /// Recording is only started manually when neither sample rate is positive
    pub fn requires_manual_start(&self) -> bool {
        self.session_sample_rate <= 0.0 && self.error_sample_rate <= 0.0
    }

    /// Slow click settings, or `None` when detection is disabled
    pub fn slow_click(&self) -> Option<SlowClickConfig> {
        if self.slow_click_timeout == 0 {
            return None;
        }
        Some(SlowClickConfig {
            threshold: defaults::SLOW_CLICK_THRESHOLD,
            timeout: self.slow_click_timeout,
            scroll_timeout: defaults::SLOW_CLICK_SCROLL_TIMEOUT,
            ignore_selector: self.slow_click_ignore_selectors.join(","),
        })
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplayConfig::default();
        assert!(config.sticky_session);
        assert!(config.use_compression);
        assert_eq!(config.flush_min_delay, 5_000);
        assert_eq!(config.flush_max_delay, 5_500);
        assert!(config.requires_manual_start());
    }

    #[test]
    fn test_normalized_clamps_durations() {
        let config = ReplayConfig::new()
            .with_min_replay_duration(60_000)
            .with_max_replay_duration(10 * 3_600_000)
            .with_session_sample_rate(4.0)
            .normalized();

        assert_eq!(config.min_replay_duration, 15_000);
        assert_eq!(config.max_replay_duration, 3_600_000);
        assert_eq!(config.session_sample_rate, 1.0);
    }

    #[test]
    fn test_slow_click_disabled_by_zero_timeout() {
        let config = ReplayConfig::new().with_slow_click_timeout(0);
        assert!(config.slow_click().is_none());

        let config = ReplayConfig::new()
            .with_slow_click_ignore_selectors(vec![".a".to_string(), "#b".to_string()]);
        let slow_click = config.slow_click().unwrap();
        assert_eq!(slow_click.timeout, 7_000);
        assert_eq!(slow_click.ignore_selector, ".a,#b");
    }

    #[test]
    fn test_deserialize_camel_case_with_defaults() {
        let json = r#"{"sessionSampleRate":0.5,"stickySession":false,"experiments":{"captureExceptions":true}}"#;
        let config: ReplayConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.session_sample_rate, 0.5);
        assert!(!config.sticky_session);
        assert!(config.experiments.capture_exceptions);
        assert_eq!(config.max_replay_duration, 3_600_000);
    }
}
