//! Error types for the sink
//!
//! Every error is scoped to a single sink session. The pipeline manager
//! guarantees that a failed build or start leaves no half-built pipeline
//! behind, so callers may simply retry with the next frame.

use std::fmt;

use thiserror::Error;

use crate::frame::PixelFormat;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SinkError>;

/// Failure reported by the external pipeline engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    /// Engine specific diagnostic code
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why a running pipeline stopped being usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The engine reported an unrecoverable error
    Error { code: i32, message: String },
    /// The engine reached end of stream
    EndOfStream,
    /// Too many consecutive ingest failures
    RepeatedSubmitFailures { count: u32 },
}

/// Diagnostic recorded when a pipeline is invalidated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFault {
    /// Pipeline generation the fault belongs to
    pub generation: u64,
    pub kind: FaultKind,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FaultKind::Error { code, message } => write!(
                f,
                "pipeline #{} failed with error {}: {}",
                self.generation, code, message
            ),
            FaultKind::EndOfStream => {
                write!(f, "pipeline #{} reached end of stream", self.generation)
            }
            FaultKind::RepeatedSubmitFailures { count } => write!(
                f,
                "pipeline #{} rejected {} consecutive buffers",
                self.generation, count
            ),
        }
    }
}

/// Errors surfaced to the caller of [`crate::SinkSession::display`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Frame is not in the single supported planar 4:2:0 layout
    #[error("unsupported pixel format {0:?}, only I420 is accepted")]
    UnsupportedFormat(PixelFormat),

    /// Frame geometry does not match its plane data
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Packed buffer allocation failed
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// Constructing the pipeline graph failed
    #[error("pipeline build failed ({code}): {message}")]
    PipelineBuild { code: i32, message: String },

    /// Switching the pipeline to playing failed
    #[error("pipeline start failed ({code}): {message}")]
    PipelineStart { code: i32, message: String },

    /// An asynchronous fault was observed and the pipeline could not be used
    #[error("pipeline fault: {0}")]
    PipelineFault(PipelineFault),

    /// The engine rejected a buffer
    #[error("buffer submission failed ({code}): {message}")]
    Submit { code: i32, message: String },

    /// The consumer stayed saturated for the whole wait budget, frame dropped
    #[error("timed out waiting for the pipeline to accept data, frame dropped")]
    TimedOut,

    /// The gate was closed while waiting, frame dropped
    #[error("pipeline was torn down while waiting, frame dropped")]
    GateClosed,

    /// End-of-stream policy halted the session
    #[error("sink stopped: {0}")]
    Stopped(PipelineFault),

    /// The session has been closed
    #[error("sink session is closed")]
    Closed,

    /// The event watcher thread could not be started
    #[error("failed to start event watcher: {0}")]
    Watcher(String),

    /// Requested display backend is not registered
    #[error("unknown display backend '{0}'")]
    UnknownBackend(String),
}

impl SinkError {
    /// Whether retrying (the same or the next frame) may succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SinkError::UnsupportedFormat(_)
                | SinkError::InvalidFrame(_)
                | SinkError::Stopped(_)
                | SinkError::Closed
                | SinkError::Watcher(_)
                | SinkError::UnknownBackend(_)
        )
    }

    /// Whether the frame was dropped without being a hard failure
    pub fn is_frame_drop(&self) -> bool {
        matches!(self, SinkError::TimedOut | SinkError::GateClosed)
    }
}
