//! Session tuning knobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default read size of the output pump
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default time `release` waits for the pump at each escalation step
pub const DEFAULT_RELEASE_GRACE_MS: u64 = 2000;

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Maximum bytes per blocking read, and so per output chunk
    pub read_buffer_size: usize,
    /// Milliseconds to wait for the pump after hanging up, and again after killing
    pub release_grace_ms: u64,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            release_grace_ms: DEFAULT_RELEASE_GRACE_MS,
        }
    }
}

impl PtyConfig {
    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), String> {
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be positive".to_string());
        }
        Ok(())
    }

    /// Parse a JSON config, filling missing fields with defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
