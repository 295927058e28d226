//! Pipeline lifecycle management
//!
//! Owns the single engine handle of a session and moves it through
//! `Absent → Building → Active → (Faulted | Absent)`. All transitions except
//! invalidation run on the producer thread.

use log::{error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{EngineError, FaultKind, PipelineFault, Result, SinkError};
use crate::frame::FrameSize;
use crate::pipeline::engine::{
    EngineHandle, EngineState, IngestInterrupt, PipelineDescriptor, PipelineEngine,
};
use crate::pipeline::gate::FlowGate;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::packer::PackedBuffer;
use crate::pipeline::state::PipelineState;
use crate::pipeline::watcher::ErrorWatcher;

/// Diagnostic code used when an operation is attempted in the wrong state
const INVALID_STATE: i32 = -1;

#[derive(Default)]
struct SlotState {
    gate: Option<Arc<FlowGate>>,
    interrupt: Option<IngestInterrupt>,
    shut: bool,
}

/// Holder of the live pipeline's gate, reachable from other threads
///
/// Lets a session be closed from outside the producer thread: shutting the
/// slot closes whatever gate is live, interrupts an ingest blocked inside
/// the engine (releasing a blocked producer either way) and makes every
/// later install fail, so no new pipeline can come up afterwards.
#[derive(Default)]
pub struct GateSlot {
    state: Mutex<SlotState>,
}

impl GateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `gate` the live one; false once the slot has been shut
    pub fn install(&self, gate: Arc<FlowGate>, interrupt: Option<IngestInterrupt>) -> bool {
        let mut state = self.lock();
        if state.shut {
            gate.close();
            return false;
        }
        if let Some(old) = state.gate.replace(gate) {
            old.close();
        }
        state.interrupt = interrupt;
        true
    }

    /// Close and forget the live gate
    pub fn close_current(&self) {
        let mut state = self.lock();
        state.interrupt = None;
        if let Some(gate) = state.gate.take() {
            gate.close();
        }
    }

    /// Close the live gate, abort a blocked ingest and refuse any further installs
    pub fn shutdown(&self) {
        let interrupt = {
            let mut state = self.lock();
            state.shut = true;
            if let Some(gate) = state.gate.take() {
                gate.close();
            }
            state.interrupt.take()
        };
        // gate is closed first so the aborted ingest reads as a close
        if let Some(interrupt) = interrupt {
            interrupt();
        }
    }

    pub fn is_shut(&self) -> bool {
        self.lock().shut
    }

    pub fn current(&self) -> Option<Arc<FlowGate>> {
        self.lock().gate.clone()
    }
}

/// Size and device a pipeline was built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTarget {
    pub size: FrameSize,
    pub device: String,
}

pub struct PipelineManager<E: PipelineEngine> {
    engine: E,
    state: PipelineState,
    handle: Option<E::Handle>,
    gate: Option<Arc<FlowGate>>,
    gates: Arc<GateSlot>,
    target: Option<PipelineTarget>,
    generation: u64,
    watcher: ErrorWatcher,
    health: Arc<PipelineHealth>,
    framerate: u32,
    max_bytes: u64,
}

impl<E: PipelineEngine> PipelineManager<E> {
    pub fn new(
        engine: E,
        watcher: ErrorWatcher,
        gates: Arc<GateSlot>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            engine,
            state: PipelineState::Absent,
            handle: None,
            gate: None,
            gates,
            target: None,
            generation: 0,
            watcher,
            health,
            framerate: 30,
            max_bytes: 6_000_000,
        }
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Generation of the most recently built pipeline
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target(&self) -> Option<&PipelineTarget> {
        self.target.as_ref()
    }

    /// Gate of the live pipeline
    pub fn gate(&self) -> Option<Arc<FlowGate>> {
        self.gate.clone()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Whether a submission of `size` to `device` needs a fresh pipeline
    pub fn needs_rebuild(&self, size: FrameSize, device: &str) -> bool {
        if !self.state.is_active() {
            return true;
        }
        match &self.target {
            Some(target) => target.size != size || target.device != device,
            None => true,
        }
    }

    /// Construct the graph for `size` on `device`; legal only from `Absent`
    pub fn build(&mut self, size: FrameSize, device: &str) -> Result<()> {
        if self.state != PipelineState::Absent {
            return Err(SinkError::PipelineBuild {
                code: INVALID_STATE,
                message: format!("cannot build while {}", self.state),
            });
        }

        self.state = PipelineState::Building;
        self.generation += 1;
        let generation = self.generation;

        let descriptor = PipelineDescriptor::new(size, device)
            .with_framerate(self.framerate)
            .with_max_bytes(self.max_bytes);
        info!("PipelineManager: building #{} ({})", generation, descriptor);

        let handle = match self.engine.build(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                self.state = PipelineState::Absent;
                warn!("PipelineManager: build #{} failed: {}", generation, e);
                return Err(SinkError::PipelineBuild {
                    code: e.code,
                    message: e.message,
                });
            }
        };
        let interrupt = handle.ingest_interrupt();
        self.handle = Some(handle);

        let gate = Arc::new(FlowGate::new());
        if !self.gates.install(gate.clone(), interrupt) {
            self.teardown();
            return Err(SinkError::Closed);
        }
        self.gate = Some(gate.clone());

        if let Err(e) = self.hook_up(gate, generation) {
            warn!("PipelineManager: wiring #{} failed: {}", generation, e);
            self.teardown();
            return Err(SinkError::PipelineBuild {
                code: e.code,
                message: e.message,
            });
        }

        self.target = Some(PipelineTarget {
            size,
            device: device.to_string(),
        });
        Ok(())
    }

    fn hook_up(&mut self, gate: Arc<FlowGate>, generation: u64) -> std::result::Result<(), EngineError> {
        let observer = self.watcher.observer(generation);
        let Some(handle) = self.handle.as_mut() else {
            return Err(EngineError::new(INVALID_STATE, "no pipeline handle"));
        };
        handle.set_watermark_callbacks(gate)?;
        // armed before the observer exists so nothing reported for this
        // generation can be missed
        self.watcher.latch().arm(generation);
        handle.set_event_observer(observer)?;
        Ok(())
    }

    /// Switch the built pipeline to playing; legal only from `Building`
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Building {
            return Err(SinkError::PipelineStart {
                code: INVALID_STATE,
                message: format!("cannot start while {}", self.state),
            });
        }
        let Some(handle) = self.handle.as_mut() else {
            self.state = PipelineState::Absent;
            return Err(SinkError::PipelineStart {
                code: INVALID_STATE,
                message: "no pipeline handle".into(),
            });
        };

        if let Err(e) = handle.set_state(EngineState::Playing) {
            error!(
                "PipelineManager: starting #{} failed: {}",
                self.generation, e
            );
            self.teardown();
            return Err(SinkError::PipelineStart {
                code: e.code,
                message: e.message,
            });
        }

        self.state = PipelineState::Active {
            started_at: std::time::Instant::now(),
        };
        self.health.record_build();
        info!("PipelineManager: pipeline #{} running", self.generation);
        Ok(())
    }

    /// Release everything; safe from any state, a no-op when `Absent`
    ///
    /// The gate is closed before any engine resource goes away, then the
    /// handle is released in reverse order of acquisition.
    pub fn teardown(&mut self) {
        if self.state == PipelineState::Absent && self.handle.is_none() && self.gate.is_none() {
            return;
        }

        if let Some(gate) = self.gate.take() {
            gate.close();
        }
        self.gates.close_current();
        self.watcher.latch().disarm();

        if let Some(mut handle) = self.handle.take() {
            handle.release_ingest();
            handle.clear_event_observer();
            if let Err(e) = handle.set_state(EngineState::Null) {
                warn!(
                    "PipelineManager: stopping #{} failed: {}",
                    self.generation, e
                );
            }
            handle.release();
        }

        let previous = self.state;
        self.state = PipelineState::Absent;
        self.target = None;
        info!(
            "PipelineManager: pipeline #{} torn down (was {}). {}",
            self.generation,
            previous,
            self.health.summary()
        );
    }

    /// Mark the live pipeline broken; callable from any thread holding the latch
    pub fn invalidate(&self, kind: FaultKind) -> bool {
        let tripped = self.watcher.latch().trip(PipelineFault {
            generation: self.generation,
            kind,
        });
        if tripped {
            self.health.record_fault();
        }
        tripped
    }

    /// Pick up a fault reported since the last call, moving to `Faulted`
    pub fn poll_fault(&mut self) -> Option<PipelineFault> {
        self.watcher.drain();
        let fault = self.watcher.latch().take()?;
        if self.state.can_transition_to(&PipelineState::Faulted) {
            self.state = PipelineState::Faulted;
        }
        Some(fault)
    }

    /// Make sure an active pipeline matching `size` and `device` exists
    ///
    /// Returns whether a rebuild happened. Resolution changes, device changes
    /// and fault recovery all take this path.
    pub fn ensure(&mut self, size: FrameSize, device: &str) -> Result<bool> {
        if !self.needs_rebuild(size, device) {
            return Ok(false);
        }
        self.teardown();
        self.build(size, device)?;
        self.start()?;
        Ok(true)
    }

    /// Hand a packed buffer to the live pipeline
    pub fn ingest(&mut self, buffer: PackedBuffer) -> std::result::Result<(), EngineError> {
        match self.handle.as_mut() {
            Some(handle) if self.state.is_active() => handle.ingest(buffer),
            _ => Err(EngineError::new(
                INVALID_STATE,
                format!("pipeline is {}", self.state),
            )),
        }
    }

    /// Tear down and stop observing events
    pub fn shutdown(&mut self) {
        self.teardown();
        self.watcher.stop();
    }
}

impl<E: PipelineEngine> Drop for PipelineManager<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}
