use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::pipeline::watcher::{EosPolicy, WatcherMode};

/// Output device used when none is configured
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Name the V4L2 sink backend registers under
pub const BACKEND_NAME: &str = "gst_v4l2_sink";

/// What a frame that waited out the whole timeout turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Return [`crate::SinkError::TimedOut`] so the caller sees the drop
    #[default]
    Report,
    /// Return [`crate::SubmitOutcome::Dropped`], only counted in health
    Silent,
}

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Output device; `None` or empty means [`DEFAULT_DEVICE`]
    pub device: Option<String>,
    /// Longest a frame may wait on a saturated pipeline before it is stale
    pub wait_timeout_ms: u64,
    /// Bound on the ingest queue inside the pipeline
    pub max_queue_bytes: u64,
    pub framerate: u32,
    pub eos_policy: EosPolicy,
    pub timeout_policy: TimeoutPolicy,
    pub watcher_mode: WatcherMode,
    /// Consecutive rejected buffers before the pipeline is considered broken
    pub submit_error_threshold: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            wait_timeout_ms: 5_000,
            max_queue_bytes: 6_000_000,
            framerate: 30,
            eos_policy: EosPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            watcher_mode: WatcherMode::default(),
            submit_error_threshold: 3,
        }
    }
}

impl SinkConfig {
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Device path to open, falling back to [`DEFAULT_DEVICE`]
    pub fn device_path(&self) -> &str {
        match self.device.as_deref().map(str::trim) {
            Some(device) if !device.is_empty() => device,
            _ => DEFAULT_DEVICE,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_json(&text)
            .map_err(|e| anyhow::anyhow!("Invalid sink config {}: {}", path.display(), e))
    }
}

/// Parsed `video_display` value of the host configuration
///
/// ```text
/// video_display   gst_v4l2_sink,/dev/video1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySpec {
    pub backend: String,
    pub device: Option<String>,
}

impl DisplaySpec {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value
            .strip_prefix("video_display")
            .map(str::trim_start)
            .unwrap_or(value);

        let (backend, device) = match value.split_once(',') {
            Some((backend, device)) => (backend.trim(), Some(device.trim())),
            None => (value, None),
        };
        if backend.is_empty() {
            return None;
        }

        Some(Self {
            backend: backend.to_string(),
            device: device.filter(|d| !d.is_empty()).map(str::to_string),
        })
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
