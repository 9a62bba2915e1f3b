//! Runtime configuration

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tuning knobs shared by all datasets of one [`crate::access::VolumeAccess`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Upper bound of decoded data kept by the block cache
    pub cache_max_bytes: usize,

    /// Background fetch workers of each volatile overlay
    pub fetch_workers: usize,

    /// Concurrent classification tasks during discovery
    pub discovery_workers: usize,

    /// Completion polling period of discovery
    pub discovery_poll_interval_ms: u64,

    /// Priority of overlay fetches when the caller does not pass one
    pub default_priority: i32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: 512 * 1024 * 1024,
            fetch_workers: 4,
            discovery_workers: 12,
            discovery_poll_interval_ms: 20,
            default_priority: 0,
        }
    }
}

impl VolumeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_max_bytes(mut self, bytes: usize) -> Self {
        self.cache_max_bytes = bytes;
        self
    }

    pub fn with_fetch_workers(mut self, workers: usize) -> Self {
        self.fetch_workers = workers;
        self
    }

    pub fn with_discovery_workers(mut self, workers: usize) -> Self {
        self.discovery_workers = workers;
        self
    }

    pub fn with_discovery_poll_interval_ms(mut self, millis: u64) -> Self {
        self.discovery_poll_interval_ms = millis;
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    /// Load and validate a JSON configuration file; missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| VolumeError::io(&display, e))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| VolumeError::configuration(&display, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("cacheMaxBytes", self.cache_max_bytes == 0),
            ("fetchWorkers", self.fetch_workers == 0),
            ("discoveryWorkers", self.discovery_workers == 0),
            ("discoveryPollIntervalMs", self.discovery_poll_interval_ms == 0),
        ];
        match checks.iter().find(|(_, invalid)| *invalid) {
            Some((key, _)) => Err(VolumeError::configuration(*key, "must be greater than zero")),
            None => Ok(()),
        }
    }
}
