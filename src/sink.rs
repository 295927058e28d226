//! Caller facing sink session
//!
//! A [`SinkSession`] is what the host's display module holds between open
//! and close. Frames arrive on one producer thread; `close` may come from
//! any thread and releases a producer blocked on a saturated pipeline.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::SinkConfig;
use crate::error::{PipelineFault, Result, SinkError};
use crate::frame::VideoFrame;
use crate::pipeline::engine::PipelineEngine;
use crate::pipeline::feeder::{FrameFeeder, SubmitOutcome};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::lifecycle::{GateSlot, PipelineManager};
use crate::pipeline::state::PipelineState;
use crate::pipeline::watcher::ErrorWatcher;

pub struct SinkSession<E: PipelineEngine> {
    feeder: Mutex<FrameFeeder<E>>,
    gates: Arc<GateSlot>,
    closed: AtomicBool,
    health: Arc<PipelineHealth>,
    device: String,
}

impl<E: PipelineEngine> SinkSession<E> {
    /// Open a session; the pipeline itself is built lazily for the first frame
    pub fn open(engine: E, config: SinkConfig) -> Result<Self> {
        let health = Arc::new(PipelineHealth::new());
        let watcher = ErrorWatcher::new(config.watcher_mode, health.clone())
            .map_err(|e| SinkError::Watcher(e.to_string()))?;
        let gates = Arc::new(GateSlot::new());

        let manager = PipelineManager::new(engine, watcher, gates.clone(), health.clone())
            .with_framerate(config.framerate)
            .with_max_bytes(config.max_queue_bytes);

        let device = config.device_path().to_string();
        info!(
            "SinkSession: opened for {} ({:?} watcher, eos {:?})",
            device, config.watcher_mode, config.eos_policy
        );

        Ok(Self {
            feeder: Mutex::new(FrameFeeder::new(manager, config)),
            gates,
            closed: AtomicBool::new(false),
            health,
            device,
        })
    }

    fn feeder(&self) -> MutexGuard<'_, FrameFeeder<E>> {
        self.feeder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PipelineState {
        self.feeder().pipeline_state()
    }

    pub fn last_fault(&self) -> Option<PipelineFault> {
        self.feeder().last_fault().cloned()
    }

    /// Push one frame to the device, building or rebuilding the pipeline as needed
    pub fn display(&self, frame: &VideoFrame<'_>) -> Result<SubmitOutcome> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let mut feeder = self.feeder();
        // close may have won the race for the lock
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        feeder.submit(frame)
    }

    /// Tear down the pipeline and clear a halt; the session stays open
    pub fn reset(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.feeder().reset();
        info!("SinkSession: reset");
        Ok(())
    }

    /// Release everything; idempotent, callable from any thread
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // wakes a producer stuck in the gate or in the engine's ingest so the
        // lock below can be taken
        self.gates.shutdown();
        self.feeder().shutdown();
        info!("SinkSession: closed {}. {}", self.device, self.health.summary());
    }
}

impl<E: PipelineEngine> Drop for SinkSession<E> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("SinkSession: dropped without close");
        }
        self.close();
    }
}
