//! Scriptable in-memory engine used by the unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::EngineError;
use crate::pipeline::engine::{
    EngineHandle, EngineState, IngestInterrupt, PipelineDescriptor, PipelineEngine,
};
use crate::pipeline::gate::{FlowGate, GateState};
use crate::pipeline::packer::PackedBuffer;
use crate::pipeline::watcher::EventObserver;

/// Everything the engine was asked to do
#[derive(Debug, Default, Clone)]
pub struct MockLog {
    pub builds: Vec<PipelineDescriptor>,
    pub starts: u32,
    pub releases: u32,
    /// Lengths of ingested buffers
    pub ingested: Vec<usize>,
    pub ingested_data: Vec<Vec<u8>>,
    /// Ingest calls made while the gate of that pipeline was saturated
    pub saturated_ingests: u32,
    /// Ingest calls that blocked while ingests were held
    pub blocked_ingests: u32,
    pub interrupts: u32,
    pub live_handles: u32,
    pub max_live_handles: u32,
    /// Teardown steps in call order
    pub calls: Vec<&'static str>,
}

/// Simulated bounded queue with watermarks
#[derive(Debug)]
struct MockQueue {
    items: VecDeque<usize>,
    high: usize,
    low: usize,
}

#[derive(Default)]
struct Script {
    fail_builds: u32,
    fail_starts: u32,
    fail_ingests: u32,
    queue: Option<MockQueue>,
}

/// Blocking push simulation: a held ingest waits until interrupted
#[derive(Default)]
struct Hold {
    held: bool,
    interrupted: bool,
}

#[derive(Default)]
pub struct MockControl {
    log: Mutex<MockLog>,
    hold: Mutex<Hold>,
    hold_changed: Condvar,
    script: Mutex<Script>,
    gate: Mutex<Option<Arc<FlowGate>>>,
    observer: Mutex<Option<EventObserver>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

impl MockControl {
    pub fn log(&self) -> MockLog {
        lock(&self.log).clone()
    }

    pub fn fail_next_builds(&self, count: u32) {
        lock(&self.script).fail_builds = count;
    }

    pub fn fail_next_starts(&self, count: u32) {
        lock(&self.script).fail_starts = count;
    }

    pub fn fail_next_ingests(&self, count: u32) {
        lock(&self.script).fail_ingests = count;
    }

    /// Saturate the gate when `high` buffers are queued, reopen at `low`
    pub fn enable_queue(&self, high: usize, low: usize) {
        lock(&self.script).queue = Some(MockQueue {
            items: VecDeque::new(),
            high,
            low,
        });
    }

    /// Consume one queued buffer the way the device sink would
    pub fn consume_one(&self) -> bool {
        let mut script = lock(&self.script);
        let Some(queue) = script.queue.as_mut() else {
            return false;
        };
        if queue.items.pop_front().is_none() {
            return false;
        }
        if queue.items.len() <= queue.low {
            if let Some(gate) = lock(&self.gate).as_ref() {
                gate.set_ready();
            }
        }
        true
    }

    /// Make every following ingest block until the pipeline is interrupted
    pub fn hold_ingests(&self) {
        let mut hold = lock(&self.hold);
        hold.held = true;
        hold.interrupted = false;
    }

    fn interrupt(&self) {
        lock(&self.hold).interrupted = true;
        lock(&self.log).interrupts += 1;
        self.hold_changed.notify_all();
    }

    /// Gate registered by the live pipeline
    pub fn gate(&self) -> Option<Arc<FlowGate>> {
        lock(&self.gate).clone()
    }

    /// Event observer registered by the live pipeline
    pub fn observer(&self) -> Option<EventObserver> {
        lock(&self.observer).clone()
    }
}

pub struct MockEngine {
    control: Arc<MockControl>,
}

impl MockEngine {
    pub fn new() -> (Self, Arc<MockControl>) {
        let control = Arc::new(MockControl::default());
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

impl PipelineEngine for MockEngine {
    type Handle = MockHandle;

    fn build(&mut self, descriptor: &PipelineDescriptor) -> Result<MockHandle, EngineError> {
        {
            let mut script = lock(&self.control.script);
            if script.fail_builds > 0 {
                script.fail_builds -= 1;
                return Err(EngineError::new(22, "no element \"v4l2sink\""));
            }
            if let Some(queue) = script.queue.as_mut() {
                queue.items.clear();
            }
        }

        let mut log = lock(&self.control.log);
        log.builds.push(descriptor.clone());
        log.live_handles += 1;
        log.max_live_handles = log.max_live_handles.max(log.live_handles);

        Ok(MockHandle {
            control: self.control.clone(),
            gate: None,
        })
    }
}

pub struct MockHandle {
    control: Arc<MockControl>,
    gate: Option<Arc<FlowGate>>,
}

impl EngineHandle for MockHandle {
    fn set_watermark_callbacks(&mut self, gate: Arc<FlowGate>) -> Result<(), EngineError> {
        *lock(&self.control.gate) = Some(gate.clone());
        self.gate = Some(gate);
        Ok(())
    }

    fn set_event_observer(&mut self, observer: EventObserver) -> Result<(), EngineError> {
        *lock(&self.control.observer) = Some(observer);
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError> {
        match state {
            EngineState::Playing => {
                let mut script = lock(&self.control.script);
                if script.fail_starts > 0 {
                    script.fail_starts -= 1;
                    return Err(EngineError::new(71, "device refused caps"));
                }
                lock(&self.control.log).starts += 1;
            }
            EngineState::Null => lock(&self.control.log).calls.push("set_state_null"),
        }
        Ok(())
    }

    fn ingest(&mut self, buffer: PackedBuffer) -> Result<(), EngineError> {
        {
            let hold = lock(&self.control.hold);
            if hold.held {
                lock(&self.control.log).blocked_ingests += 1;
                let _released = self
                    .control
                    .hold_changed
                    .wait_while(hold, |h| !h.interrupted)
                    .unwrap();
                return Err(EngineError::new(-2, "flushing"));
            }
        }

        if let Some(gate) = &self.gate {
            if gate.state() == GateState::Saturated {
                lock(&self.control.log).saturated_ingests += 1;
            }
        }

        {
            let mut script = lock(&self.control.script);
            if script.fail_ingests > 0 {
                script.fail_ingests -= 1;
                return Err(EngineError::new(-2, "flushing"));
            }
            if let Some(queue) = script.queue.as_mut() {
                queue.items.push_back(buffer.len());
                if queue.items.len() >= queue.high {
                    if let Some(gate) = &self.gate {
                        gate.set_saturated();
                    }
                }
            }
        }

        let mut log = lock(&self.control.log);
        log.ingested.push(buffer.len());
        log.ingested_data.push(buffer.as_slice().to_vec());
        Ok(())
    }

    fn ingest_interrupt(&self) -> Option<IngestInterrupt> {
        let control = self.control.clone();
        Some(Arc::new(move || control.interrupt()))
    }

    fn release_ingest(&mut self) {
        self.gate = None;
        *lock(&self.control.gate) = None;
        lock(&self.control.log).calls.push("release_ingest");
    }

    fn clear_event_observer(&mut self) {
        *lock(&self.control.observer) = None;
        lock(&self.control.log).calls.push("clear_event_observer");
    }

    fn release(self) {
        let mut log = lock(&self.control.log);
        log.calls.push("release");
        log.releases += 1;
        log.live_handles -= 1;
    }
}
