//! Interface to the external media pipeline engine
//!
//! The engine owns the actual graph (`appsrc ! capsfilter ! v4l2sink`) and
//! its streaming threads. The sink only describes what it wants built and
//! drives the resulting handle through these traits.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;
use crate::frame::FrameSize;
use crate::pipeline::gate::FlowGate;
use crate::pipeline::packer::PackedBuffer;
use crate::pipeline::watcher::EventObserver;

/// Element name of the ingest stage inside the graph
pub const SOURCE_NAME: &str = "source";
/// Element name of the device sink inside the graph
pub const SINK_NAME: &str = "sink";

/// Aborts an ingest call blocked inside the engine; callable from any thread
pub type IngestInterrupt = Arc<dyn Fn() + Send + Sync>;

/// Target state for [`EngineHandle::set_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Null,
    Playing,
}

/// Everything the engine needs to construct one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    pub size: FrameSize,
    /// Output device path, already resolved against the default
    pub device: String,
    pub framerate: u32,
    /// Bound on the ingest stage's internal queue
    pub max_bytes: u64,
    /// Ingest blocks instead of dropping when its queue is full
    pub block: bool,
    /// Ingest stamps buffers with the running time on arrival
    pub do_timestamp: bool,
    pub is_live: bool,
}

impl PipelineDescriptor {
    pub fn new(size: FrameSize, device: impl Into<String>) -> Self {
        Self {
            size,
            device: device.into(),
            framerate: 30,
            max_bytes: 6_000_000,
            block: true,
            do_timestamp: true,
            is_live: true,
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

    /// Caps enforced between ingest and the device sink
    pub fn caps(&self) -> String {
        format!(
            "video/x-raw,width={},height={},format=I420,framerate={}/1,interlace-mode=progressive",
            self.size.width, self.size.height, self.framerate
        )
    }

    /// Textual pipeline description understood by `gst-launch` style parsers
    pub fn launch_line(&self) -> String {
        format!(
            "appsrc name={} is-live={} block={} do-timestamp={} max-bytes={} ! \
             capsfilter caps=\"{}\" ! \
             v4l2sink name={} async=false sync=false device={}",
            SOURCE_NAME,
            gst_bool(self.is_live),
            gst_bool(self.block),
            gst_bool(self.do_timestamp),
            self.max_bytes,
            self.caps(),
            SINK_NAME,
            quote(&self.device)
        )
    }
}

impl fmt::Display for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}fps -> {}", self.size, self.framerate, self.device)
    }
}

/// Double-quote a property value so spaces or `!` stay part of it
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn gst_bool(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Factory for pipeline handles
pub trait PipelineEngine: Send {
    type Handle: EngineHandle;

    /// Construct the graph, not yet playing
    fn build(&mut self, descriptor: &PipelineDescriptor) -> Result<Self::Handle, EngineError>;
}

/// One constructed pipeline
///
/// Release order on teardown is the reverse of acquisition:
/// [`release_ingest`](EngineHandle::release_ingest),
/// [`clear_event_observer`](EngineHandle::clear_event_observer),
/// then [`release`](EngineHandle::release).
pub trait EngineHandle: Send {
    /// Route the ingest queue's high/low watermark notifications to `gate`
    ///
    /// The engine calls [`FlowGate::set_saturated`] and
    /// [`FlowGate::set_ready`] from its own threads.
    fn set_watermark_callbacks(&mut self, gate: Arc<FlowGate>) -> Result<(), EngineError>;

    /// Route fatal error and end-of-stream notifications to `observer`
    fn set_event_observer(&mut self, observer: EventObserver) -> Result<(), EngineError>;

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError>;

    /// Hand a buffer over; on `Ok` the engine owns it
    ///
    /// May block while the engine's own queue is full.
    fn ingest(&mut self, buffer: PackedBuffer) -> Result<(), EngineError>;

    /// Hook that makes a blocked [`ingest`](EngineHandle::ingest) return an error
    fn ingest_interrupt(&self) -> Option<IngestInterrupt>;

    /// Drop the ingest endpoint and its watermark callbacks
    fn release_ingest(&mut self);

    /// Detach the event observer
    fn clear_event_observer(&mut self);

    /// Release the graph itself
    fn release(self);
}
