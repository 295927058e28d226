//! Pipeline layer of the sink
//!
//! Separates the concerns of feeding a device pipeline:
//! - Packing: contiguous buffers from strided planes (`packer`)
//! - Flow control: watermark driven gate the producer waits on (`gate`)
//! - Lifecycle: build, start, teardown and rebuild of the engine graph (`lifecycle`)
//! - Fault observation: engine events into a per-generation latch (`watcher`)
//! - Orchestration: the per-frame submission path (`feeder`)
//!
//! The engine itself sits behind the traits in `engine`.

pub mod engine;
pub mod feeder;
pub mod gate;
pub mod health;
pub mod lifecycle;
#[cfg(test)]
pub(crate) mod mock;
pub mod packer;
pub mod state;
pub mod watcher;

pub use engine::{EngineHandle, EngineState, PipelineDescriptor, PipelineEngine};
pub use feeder::{FrameFeeder, SubmitOutcome};
pub use gate::{FlowGate, GateState, WaitOutcome};
pub use health::{HealthSummary, PipelineHealth};
pub use lifecycle::{GateSlot, PipelineManager};
pub use packer::{PackedBuffer, pack};
pub use state::PipelineState;
pub use watcher::{EosPolicy, ErrorWatcher, EventObserver, FaultLatch, PipelineEvent, WatcherMode};
