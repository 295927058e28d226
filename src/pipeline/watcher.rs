//! Asynchronous pipeline fault observation
//!
//! The engine reports fatal errors and end-of-stream from its own threads.
//! Those notifications are only *queued* there: an [`EventObserver`] pushes
//! them into a channel and the [`ErrorWatcher`] turns them into a tripped
//! [`FaultLatch`], either on a dedicated thread or inline at the start of
//! each submission. The producer thread picks the fault up on its next
//! submission and rebuilds, so pipeline state is only ever mutated there.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::error::{FaultKind, PipelineFault};
use crate::pipeline::health::PipelineHealth;

/// Notification emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    FatalError { code: i32, message: String },
    EndOfStream,
    /// Informational, never invalidates
    Warning { message: String },
}

enum WatcherMsg {
    Event { generation: u64, event: PipelineEvent },
    Shutdown,
}

/// Engine-side sender, tagged with the pipeline generation it was issued for
#[derive(Clone)]
pub struct EventObserver {
    generation: u64,
    tx: mpsc::UnboundedSender<WatcherMsg>,
}

impl EventObserver {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an event; never blocks, safe from any thread
    pub fn notify(&self, event: PipelineEvent) {
        let msg = WatcherMsg::Event {
            generation: self.generation,
            event,
        };
        if self.tx.send(msg).is_err() {
            debug!("EventObserver: watcher gone, event discarded");
        }
    }

    pub fn fatal_error(&self, code: i32, message: impl Into<String>) {
        self.notify(PipelineEvent::FatalError {
            code,
            message: message.into(),
        });
    }

    pub fn end_of_stream(&self) {
        self.notify(PipelineEvent::EndOfStream);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(PipelineEvent::Warning {
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for EventObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventObserver")
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Default)]
struct LatchState {
    live: Option<u64>,
    fault: Option<PipelineFault>,
}

/// Shared "this pipeline is broken" flag
///
/// Armed for the live generation when a pipeline starts; faults reported for
/// any other generation are stale and ignored. Tripping is safe from any
/// thread, concurrently with a submission in flight.
#[derive(Debug, Default)]
pub struct FaultLatch {
    state: Mutex<LatchState>,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting faults for `generation`, dropping anything pending
    pub fn arm(&self, generation: u64) {
        let mut state = self.lock();
        state.live = Some(generation);
        state.fault = None;
    }

    pub fn disarm(&self) {
        let mut state = self.lock();
        state.live = None;
        state.fault = None;
    }

    /// Record a fault; returns false when it belongs to a dead generation.
    /// The first fault of a generation wins.
    pub fn trip(&self, fault: PipelineFault) -> bool {
        let mut state = self.lock();
        if state.live != Some(fault.generation) {
            return false;
        }
        if state.fault.is_none() {
            state.fault = Some(fault);
        }
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.lock().fault.is_some()
    }

    pub fn take(&self) -> Option<PipelineFault> {
        self.lock().fault.take()
    }
}

/// How engine notifications reach the latch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherMode {
    /// Dedicated polling thread drains the channel
    #[default]
    Thread,
    /// Channel is drained on the producer thread before every submission
    Inline,
}

/// What to do when the engine reports end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum EosPolicy {
    /// Halt the session until it is reset or reopened
    #[default]
    Stop,
    /// Rebuild on the next submission, at most `max_attempts` times per stream
    Restart { max_attempts: u32 },
}

/// Decision taken for an observed end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosAction {
    Restart,
    Halt,
}

impl EosPolicy {
    /// `restarts` is the number of end-of-stream restarts already done for the current stream
    pub fn decide(&self, restarts: u32) -> EosAction {
        match self {
            EosPolicy::Stop => EosAction::Halt,
            EosPolicy::Restart { max_attempts } if restarts < *max_attempts => EosAction::Restart,
            EosPolicy::Restart { .. } => EosAction::Halt,
        }
    }
}

fn handle_event(latch: &FaultLatch, health: &PipelineHealth, generation: u64, event: PipelineEvent) {
    let kind = match event {
        PipelineEvent::Warning { message } => {
            warn!("ErrorWatcher: pipeline #{} warning: {}", generation, message);
            return;
        }
        PipelineEvent::FatalError { code, message } => {
            error!(
                "ErrorWatcher: pipeline #{} error {}: {}",
                generation, code, message
            );
            FaultKind::Error { code, message }
        }
        PipelineEvent::EndOfStream => {
            info!("ErrorWatcher: pipeline #{} reached end of stream", generation);
            FaultKind::EndOfStream
        }
    };

    if latch.trip(PipelineFault { generation, kind }) {
        health.record_fault();
    } else {
        debug!("ErrorWatcher: ignoring event from retired pipeline #{}", generation);
    }
}

pub struct ErrorWatcher {
    mode: WatcherMode,
    tx: mpsc::UnboundedSender<WatcherMsg>,
    /// Held only in inline mode
    rx: Option<mpsc::UnboundedReceiver<WatcherMsg>>,
    thread: Option<JoinHandle<()>>,
    latch: Arc<FaultLatch>,
    health: Arc<PipelineHealth>,
}

impl ErrorWatcher {
    pub fn new(mode: WatcherMode, health: Arc<PipelineHealth>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = Arc::new(FaultLatch::new());

        let (rx, thread) = match mode {
            WatcherMode::Inline => (Some(rx), None),
            WatcherMode::Thread => {
                let latch = latch.clone();
                let health = health.clone();
                let thread = std::thread::Builder::new()
                    .name("sink-events".into())
                    .spawn(move || {
                        debug!("ErrorWatcher: started");
                        while let Some(msg) = rx.blocking_recv() {
                            match msg {
                                WatcherMsg::Event { generation, event } => {
                                    handle_event(&latch, &health, generation, event)
                                }
                                WatcherMsg::Shutdown => break,
                            }
                        }
                        debug!("ErrorWatcher: finished");
                    })?;
                (None, Some(thread))
            }
        };

        Ok(Self {
            mode,
            tx,
            rx,
            thread,
            latch,
            health,
        })
    }

    pub fn mode(&self) -> WatcherMode {
        self.mode
    }

    pub fn latch(&self) -> &Arc<FaultLatch> {
        &self.latch
    }

    /// Observer to hand to the engine for pipeline `generation`
    pub fn observer(&self, generation: u64) -> EventObserver {
        EventObserver {
            generation,
            tx: self.tx.clone(),
        }
    }

    /// Process queued events synchronously; no-op in thread mode
    pub fn drain(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        while let Ok(msg) = rx.try_recv() {
            if let WatcherMsg::Event { generation, event } = msg {
                handle_event(&self.latch, &self.health, generation, event);
            }
        }
    }

    /// Stop the polling thread and wait for it
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(WatcherMsg::Shutdown);
            if thread.join().is_err() {
                error!("ErrorWatcher: event thread panicked");
            }
        }
        self.rx = None;
    }
}

impl Drop for ErrorWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
