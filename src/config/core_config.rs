// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Buffer sizes and wait intervals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// OS thread name.
    pub name: String,
    /// How long a paused worker sleeps between checks for a resume, in µs.
    pub pause_interval_us: u64,
    /// Bound on waits for a state change (pause, resume, destroy), in µs.
    pub wait_timeout_us: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "rt-worker".to_string(),
            pause_interval_us: 1_000,
            wait_timeout_us: 1_000_000,
        }
    }
}

impl WorkerConfig {
    pub fn pause_interval(&self) -> Duration {
        Duration::from_micros(self.pause_interval_us)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_micros(self.wait_timeout_us)
    }
}

/// Queue buffer sizes, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backing size of an SPSC ring.
    pub ring_bytes: usize,
    /// Size of each of the two double-buffer halves.
    pub double_buffer_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ring_bytes: 64 * 1024,
            double_buffer_bytes: 64 * 1024,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl CoreConfig {
    /// Load config from TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
