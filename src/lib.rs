//! V4L2 video output sink
//!
//! Feeds decoded I420 frames into an `appsrc ! capsfilter ! v4l2sink`
//! pipeline, typically writing to a v4l2loopback device so other
//! applications can consume the stream as a camera. The pipeline is built
//! lazily for the first frame, rebuilt whenever the resolution changes or
//! the engine reports a fault, and throttled by the ingest queue's
//! watermark signals.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
#[cfg(feature = "gst")]
pub mod gst_engine;
pub mod pipeline;
pub mod sink;

pub use backend::{BackendRegistry, DisplayBackend, DisplaySession, EngineFactory, V4l2SinkBackend};
pub use config::{DisplaySpec, SinkConfig, TimeoutPolicy};
pub use error::{EngineError, FaultKind, PipelineFault, Result, SinkError};
pub use frame::{FrameSize, I420Image, PixelFormat, Plane, VideoFrame};
#[cfg(feature = "gst")]
pub use gst_engine::{GstEngine, GstEngineFactory};
pub use pipeline::{EosPolicy, SubmitOutcome, WatcherMode};
pub use sink::SinkSession;
