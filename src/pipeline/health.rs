//! Health counters for a sink session

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Health metrics for a sink session
///
/// Updated from the producer thread and the event watcher; every field is
/// atomic so a snapshot can be read from anywhere.
pub struct PipelineHealth {
    /// Frames handed to the engine
    pub frames_submitted: AtomicU64,

    /// Frames dropped after waiting on a saturated or closed gate
    pub frame_drops: AtomicU64,

    /// Buffers the engine refused
    pub submit_errors: AtomicU64,

    /// Faults (errors, end of stream) accepted from the engine
    pub faults: AtomicU64,

    /// Completed build + start cycles
    pub builds: AtomicU64,

    /// Total bytes handed to the engine
    pub bytes_submitted: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last submitted frame
    pub last_frame_time: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            submit_errors: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            bytes_submitted: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    /// Record a frame accepted by the engine
    pub fn record_frame(&self, size: usize) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_submitted
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submit_error(&self) {
        self.submit_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn submit_errors(&self) -> u64 {
        self.submit_errors.load(Ordering::Relaxed)
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_submitted.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last frame (Unix microseconds)
    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Dropped frames as a percentage of submitted ones
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let submitted = self.frames_submitted();
        if submitted == 0 {
            return 0.0;
        }
        (drops as f64 / submitted as f64) * 100.0
    }

    /// Check if no frame reached the engine for the given duration
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_submitted: self.frames_submitted(),
            frame_drops: self.frame_drops(),
            submit_errors: self.submit_errors(),
            faults: self.faults(),
            builds: self.builds(),
            bytes_submitted: self.bytes_submitted(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_submitted: u64,
    pub frame_drops: u64,
    pub submit_errors: u64,
    pub faults: u64,
    pub builds: u64,
    pub bytes_submitted: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} drops, {:.2}%), {} submit errors, {} faults, {} builds, {} bytes",
            self.frames_submitted,
            self.frame_drops,
            self.frame_drop_rate,
            self.submit_errors,
            self.faults,
            self.builds,
            self.bytes_submitted
        )
    }
}
