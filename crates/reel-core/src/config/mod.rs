//! Replay configuration
//!
//! This module defines configuration types and default values:
//! - `options`: Configuration structure
//! - `defaults`: Default configuration values

pub mod defaults;
pub mod options;

// Re-export configuration types
pub use options::{Experiments, ReplayConfig, SlowClickConfig};
