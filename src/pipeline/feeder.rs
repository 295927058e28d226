//! Frame submission path
//!
//! `validate → (rebuild) → pack → wait on gate → ingest`, all on the
//! caller's thread. The gate wait is the designed place for a submission to
//! block; an engine whose ingest blocks as well is released by closing the
//! session, which interrupts the ingest stage.

use log::{debug, error, warn};
use std::sync::Arc;

use crate::config::{SinkConfig, TimeoutPolicy};
use crate::error::{FaultKind, PipelineFault, Result, SinkError};
use crate::frame::{FrameSize, VideoFrame};
use crate::pipeline::engine::PipelineEngine;
use crate::pipeline::gate::WaitOutcome;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::lifecycle::PipelineManager;
use crate::pipeline::packer::{pack, validate};
use crate::pipeline::state::PipelineState;
use crate::pipeline::watcher::EosAction;

/// Successful result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Frame handed to the engine
    Submitted,
    /// Frame handed to a pipeline rebuilt after `fault` was observed
    Recovered { fault: PipelineFault },
    /// Frame waited out the timeout and was discarded (silent timeout policy)
    Dropped,
}

pub struct FrameFeeder<E: PipelineEngine> {
    manager: PipelineManager<E>,
    config: SinkConfig,
    health: Arc<PipelineHealth>,
    last_size: Option<FrameSize>,
    consecutive_submit_errors: u32,
    eos_restarts: u32,
    halted: Option<PipelineFault>,
    last_fault: Option<PipelineFault>,
}

impl<E: PipelineEngine> FrameFeeder<E> {
    pub fn new(manager: PipelineManager<E>, config: SinkConfig) -> Self {
        let health = manager.health().clone();
        Self {
            manager,
            config,
            health,
            last_size: None,
            consecutive_submit_errors: 0,
            eos_restarts: 0,
            halted: None,
            last_fault: None,
        }
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.manager.state()
    }

    /// Size of the last frame a pipeline was successfully built for
    pub fn last_size(&self) -> Option<FrameSize> {
        self.last_size
    }

    /// Most recent fault observed on this session
    pub fn last_fault(&self) -> Option<&PipelineFault> {
        self.last_fault.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Leave the halted state so the next submission builds again
    pub fn resume(&mut self) {
        if let Some(fault) = self.halted.take() {
            debug!("FrameFeeder: resuming after {}", fault);
        }
        self.eos_restarts = 0;
    }

    pub fn submit(&mut self, frame: &VideoFrame<'_>) -> Result<SubmitOutcome> {
        validate(frame)?;
        if let Some(fault) = &self.halted {
            return Err(SinkError::Stopped(fault.clone()));
        }

        let recovered = self.observe_fault()?;
        self.prepare_pipeline(frame.size, recovered.as_ref())?;

        let buffer = pack(frame)?;

        let Some(gate) = self.manager.gate() else {
            return Err(SinkError::Closed);
        };
        match gate.wait_ready(self.config.wait_timeout()) {
            WaitOutcome::ReadyNow | WaitOutcome::Released => {}
            WaitOutcome::Closed => {
                self.health.record_frame_drop();
                debug!("FrameFeeder: gate closed, dropping {} frame", frame.size);
                return Err(SinkError::GateClosed);
            }
            WaitOutcome::TimedOut => {
                self.health.record_frame_drop();
                return match self.config.timeout_policy {
                    TimeoutPolicy::Report => {
                        warn!(
                            "FrameFeeder: pipeline saturated for {:?}, dropping frame",
                            self.config.wait_timeout()
                        );
                        Err(SinkError::TimedOut)
                    }
                    TimeoutPolicy::Silent => Ok(SubmitOutcome::Dropped),
                };
            }
        }

        let len = buffer.len();
        match self.manager.ingest(buffer) {
            Ok(()) => {
                self.health.record_frame(len);
                self.consecutive_submit_errors = 0;
                Ok(match recovered {
                    Some(fault) => SubmitOutcome::Recovered { fault },
                    None => SubmitOutcome::Submitted,
                })
            }
            Err(e) if gate.is_closed() => {
                // ingest was interrupted by a close from another thread
                self.health.record_frame_drop();
                debug!("FrameFeeder: ingest interrupted by close: {}", e);
                Err(SinkError::GateClosed)
            }
            Err(e) => {
                self.health.record_submit_error();
                self.consecutive_submit_errors += 1;
                warn!(
                    "FrameFeeder: pushing buffer failed ({} in a row): {}",
                    self.consecutive_submit_errors, e
                );
                if self.consecutive_submit_errors >= self.config.submit_error_threshold.max(1) {
                    self.manager.invalidate(FaultKind::RepeatedSubmitFailures {
                        count: self.consecutive_submit_errors,
                    });
                    self.consecutive_submit_errors = 0;
                }
                Err(SinkError::Submit {
                    code: e.code,
                    message: e.message,
                })
            }
        }
    }

    /// Collect a pending fault and apply the end-of-stream policy to it
    fn observe_fault(&mut self) -> Result<Option<PipelineFault>> {
        let Some(fault) = self.manager.poll_fault() else {
            return Ok(None);
        };
        warn!("FrameFeeder: {}", fault);
        self.last_fault = Some(fault.clone());

        if fault.kind == FaultKind::EndOfStream {
            match self.config.eos_policy.decide(self.eos_restarts) {
                EosAction::Restart => {
                    self.eos_restarts += 1;
                    debug!("FrameFeeder: end-of-stream restart {}", self.eos_restarts);
                }
                EosAction::Halt => {
                    self.manager.teardown();
                    self.halted = Some(fault.clone());
                    return Err(SinkError::Stopped(fault));
                }
            }
        }
        Ok(Some(fault))
    }

    fn prepare_pipeline(&mut self, size: FrameSize, fault: Option<&PipelineFault>) -> Result<()> {
        if self.last_size.is_some_and(|last| last != size) {
            // new stream as far as end-of-stream restarts are concerned
            self.eos_restarts = 0;
        }

        let device = self.config.device_path().to_string();
        match self.manager.ensure(size, &device) {
            Ok(true) => {
                self.last_size = Some(size);
                self.consecutive_submit_errors = 0;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!("FrameFeeder: pipeline initialization failed: {}", e);
                match fault {
                    Some(fault) if !matches!(e, SinkError::Closed) => {
                        Err(SinkError::PipelineFault(fault.clone()))
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Drop the current pipeline and any halt; the next frame starts fresh
    pub fn reset(&mut self) {
        self.manager.teardown();
        self.resume();
        self.consecutive_submit_errors = 0;
    }

    /// Tear the pipeline down for good
    pub fn shutdown(&mut self) {
        self.manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{I420Image, PixelFormat, Plane};
    use crate::pipeline::gate::GateState;
    use crate::pipeline::lifecycle::GateSlot;
    use crate::pipeline::mock::{MockControl, MockEngine};
    use crate::pipeline::watcher::{EosPolicy, ErrorWatcher, WatcherMode};
    use std::time::Duration;

    fn feeder_with(config: SinkConfig) -> (FrameFeeder<MockEngine>, Arc<MockControl>) {
        let (engine, control) = MockEngine::new();
        let health = Arc::new(PipelineHealth::new());
        let watcher = ErrorWatcher::new(config.watcher_mode, health.clone()).unwrap();
        let manager = PipelineManager::new(engine, watcher, Arc::new(GateSlot::new()), health);
        (FrameFeeder::new(manager, config), control)
    }

    fn feeder() -> (FrameFeeder<MockEngine>, Arc<MockControl>) {
        feeder_with(SinkConfig {
            device: Some("/dev/video0".into()),
            watcher_mode: WatcherMode::Inline,
            wait_timeout_ms: 100,
            ..SinkConfig::default()
        })
    }

    fn image(width: u32, height: u32) -> I420Image {
        I420Image::black(FrameSize::new(width, height))
    }

    #[test]
    fn test_resolution_change_scenario() {
        let (mut feeder, control) = feeder();
        let vga = image(640, 480);
        let qvga = image(320, 240);

        for _ in 0..3 {
            assert_eq!(feeder.submit(&vga.as_frame()), Ok(SubmitOutcome::Submitted));
        }
        assert_eq!(feeder.submit(&qvga.as_frame()), Ok(SubmitOutcome::Submitted));

        let log = control.log();
        assert_eq!(log.builds.len(), 2);
        assert_eq!(log.starts, 2);
        assert_eq!(log.releases, 1);
        assert_eq!(log.builds[0].device, "/dev/video0");
        assert_eq!(log.builds[1].size, FrameSize::new(320, 240));
        assert_eq!(
            log.ingested,
            vec![460_800, 460_800, 460_800, 115_200]
        );
        assert_eq!(feeder.last_size(), Some(FrameSize::new(320, 240)));
    }

    #[test]
    fn test_identical_frames_build_once() {
        let (mut feeder, control) = feeder();
        let frame = image(64, 48);

        feeder.submit(&frame.as_frame()).unwrap();
        feeder.submit(&frame.as_frame()).unwrap();
        assert_eq!(control.log().builds.len(), 1);
        assert_eq!(control.log().starts, 1);

        feeder.submit(&image(32, 48).as_frame()).unwrap();
        let log = control.log();
        assert_eq!(log.builds.len(), 2);
        assert_eq!(log.releases, 1);
    }

    #[test]
    fn test_ingested_bytes_match_planes() {
        let (mut feeder, control) = feeder();
        let mut frame = image(4, 2);
        frame.y = (1..=8).collect();
        frame.u = vec![9, 10];
        frame.v = vec![11, 12];

        feeder.submit(&frame.as_frame()).unwrap();
        assert_eq!(
            control.log().ingested_data[0],
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn test_rejects_format_before_building() {
        let (mut feeder, control) = feeder();
        let image = image(4, 2);
        let mut frame = image.as_frame();
        frame.format = PixelFormat::Bgra;

        assert_eq!(
            feeder.submit(&frame),
            Err(SinkError::UnsupportedFormat(PixelFormat::Bgra))
        );
        assert!(control.log().builds.is_empty());
    }

    #[test]
    fn test_malformed_frame_keeps_running_pipeline() {
        let (mut feeder, control) = feeder();
        let vga = image(640, 480);
        feeder.submit(&vga.as_frame()).unwrap();

        let short = [0u8; 10];
        let truncated = VideoFrame::i420(
            FrameSize::new(320, 240),
            Plane::new(&short, 320),
            Plane::new(&short, 160),
            Plane::new(&short, 160),
        );
        assert!(matches!(
            feeder.submit(&truncated),
            Err(SinkError::InvalidFrame(_))
        ));

        let empty = image(0, 0);
        assert!(matches!(
            feeder.submit(&empty.as_frame()),
            Err(SinkError::InvalidFrame(_))
        ));

        let log = control.log();
        assert_eq!(log.builds.len(), 1);
        assert_eq!(log.releases, 0);
        assert_eq!(feeder.last_size(), Some(FrameSize::new(640, 480)));
        assert!(feeder.pipeline_state().is_active());

        assert_eq!(feeder.submit(&vga.as_frame()), Ok(SubmitOutcome::Submitted));
        assert_eq!(control.log().builds.len(), 1);
    }

    #[test]
    fn test_zero_strides_never_reach_engine() {
        let (mut feeder, control) = feeder();
        let vga = image(640, 480);
        feeder.submit(&vga.as_frame()).unwrap();

        let mut frame = vga.as_frame();
        for plane in frame.planes.iter_mut() {
            plane.stride = 0;
        }
        assert!(matches!(
            feeder.submit(&frame),
            Err(SinkError::InvalidFrame(_))
        ));
        assert_eq!(control.log().ingested, vec![460_800]);
    }

    #[test]
    fn test_build_error_propagates_and_next_frame_retries() {
        let (mut feeder, control) = feeder();
        control.fail_next_builds(1);
        let frame = image(8, 8);

        assert!(matches!(
            feeder.submit(&frame.as_frame()),
            Err(SinkError::PipelineBuild { code: 22, .. })
        ));
        assert_eq!(feeder.pipeline_state(), PipelineState::Absent);
        assert!(control.log().ingested.is_empty());

        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
    }

    #[test]
    fn test_fatal_error_triggers_rebuild_and_reports() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);

        feeder.submit(&frame.as_frame()).unwrap();
        control.observer().unwrap().fatal_error(5, "device unplugged");

        let outcome = feeder.submit(&frame.as_frame()).unwrap();
        match outcome {
            SubmitOutcome::Recovered { fault } => {
                assert_eq!(fault.generation, 1);
                assert!(matches!(fault.kind, FaultKind::Error { code: 5, .. }));
            }
            other => panic!("expected a recovered submission, got {:?}", other),
        }

        let log = control.log();
        assert_eq!(log.builds.len(), 2);
        assert_eq!(log.ingested.len(), 2);
        assert!(feeder.last_fault().is_some());
        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
    }

    #[test]
    fn test_fault_with_failed_rebuild_is_reported() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);

        feeder.submit(&frame.as_frame()).unwrap();
        control.observer().unwrap().fatal_error(5, "device unplugged");
        control.fail_next_builds(1);

        assert!(matches!(
            feeder.submit(&frame.as_frame()),
            Err(SinkError::PipelineFault(_))
        ));
        assert_eq!(control.log().ingested.len(), 1);

        // next attempt simply rebuilds
        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
    }

    #[test]
    fn test_eos_stop_policy_halts() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);

        feeder.submit(&frame.as_frame()).unwrap();
        control.observer().unwrap().end_of_stream();

        assert!(matches!(
            feeder.submit(&frame.as_frame()),
            Err(SinkError::Stopped(PipelineFault {
                kind: FaultKind::EndOfStream,
                ..
            }))
        ));
        assert!(feeder.is_halted());
        assert_eq!(feeder.pipeline_state(), PipelineState::Absent);
        assert!(matches!(
            feeder.submit(&frame.as_frame()),
            Err(SinkError::Stopped(_))
        ));
        assert_eq!(control.log().builds.len(), 1);

        feeder.resume();
        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
        assert_eq!(control.log().builds.len(), 2);
    }

    #[test]
    fn test_eos_restart_policy_is_bounded() {
        let (mut feeder, control) = feeder_with(SinkConfig {
            watcher_mode: WatcherMode::Inline,
            eos_policy: EosPolicy::Restart { max_attempts: 2 },
            ..SinkConfig::default()
        });
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        for _ in 0..2 {
            control.observer().unwrap().end_of_stream();
            assert!(matches!(
                feeder.submit(&frame.as_frame()),
                Ok(SubmitOutcome::Recovered { .. })
            ));
        }

        control.observer().unwrap().end_of_stream();
        assert!(matches!(
            feeder.submit(&frame.as_frame()),
            Err(SinkError::Stopped(_))
        ));
        assert_eq!(control.log().builds.len(), 3);
    }

    #[test]
    fn test_timeout_reported() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        control.gate().unwrap().set_saturated();
        assert_eq!(feeder.submit(&frame.as_frame()), Err(SinkError::TimedOut));
        assert_eq!(control.log().ingested.len(), 1);
        assert_eq!(feeder.health.frame_drops(), 1);
    }

    #[test]
    fn test_timeout_silent() {
        let (mut feeder, control) = feeder_with(SinkConfig {
            watcher_mode: WatcherMode::Inline,
            wait_timeout_ms: 20,
            timeout_policy: TimeoutPolicy::Silent,
            ..SinkConfig::default()
        });
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        control.gate().unwrap().set_saturated();
        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Dropped));
        assert_eq!(control.log().ingested.len(), 1);
    }

    #[test]
    fn test_repeated_submit_errors_escalate() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        control.fail_next_ingests(3);
        for _ in 0..3 {
            assert!(matches!(
                feeder.submit(&frame.as_frame()),
                Err(SinkError::Submit { code: -2, .. })
            ));
        }
        assert_eq!(control.log().builds.len(), 1);

        let outcome = feeder.submit(&frame.as_frame()).unwrap();
        assert!(matches!(
            outcome,
            SubmitOutcome::Recovered {
                fault: PipelineFault {
                    kind: FaultKind::RepeatedSubmitFailures { count: 3 },
                    ..
                }
            }
        ));
        assert_eq!(control.log().builds.len(), 2);
    }

    #[test]
    fn test_single_submit_error_keeps_pipeline() {
        let (mut feeder, control) = feeder();
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        control.fail_next_ingests(1);
        assert!(feeder.submit(&frame.as_frame()).is_err());
        assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
        assert_eq!(control.log().builds.len(), 1);
    }

    #[test]
    fn test_thread_watcher_fault_observed() {
        let (mut feeder, control) = feeder_with(SinkConfig {
            watcher_mode: WatcherMode::Thread,
            ..SinkConfig::default()
        });
        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();

        control.observer().unwrap().fatal_error(9, "stream error");
        let mut outcome = None;
        for _ in 0..200 {
            match feeder.submit(&frame.as_frame()).unwrap() {
                SubmitOutcome::Submitted => std::thread::sleep(Duration::from_millis(5)),
                other => {
                    outcome = Some(other);
                    break;
                }
            }
        }

        assert!(matches!(outcome, Some(SubmitOutcome::Recovered { .. })));
        assert_eq!(control.log().builds.len(), 2);
        feeder.shutdown();
    }

    #[test]
    fn test_no_ingest_while_saturated() {
        let (mut feeder, control) = feeder_with(SinkConfig {
            watcher_mode: WatcherMode::Inline,
            wait_timeout_ms: 5_000,
            ..SinkConfig::default()
        });
        control.enable_queue(3, 1);
        let frame = image(32, 32);
        feeder.submit(&frame.as_frame()).unwrap();

        let consumer = {
            let control = control.clone();
            std::thread::spawn(move || {
                let mut consumed = 0;
                while consumed < 200 {
                    if control.consume_one() {
                        consumed += 1;
                    }
                    std::thread::sleep(Duration::from_micros(rand::random_range(0..300)));
                }
            })
        };

        for _ in 0..199 {
            assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
        }
        consumer.join().unwrap();

        let log = control.log();
        assert_eq!(log.ingested.len(), 200);
        assert_eq!(log.saturated_ingests, 0);
        assert_eq!(control.gate().map(|g| g.state()), Some(GateState::Ready));
    }

    #[test]
    fn test_watermarks_flipping_from_engine_thread() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (mut feeder, control) = feeder_with(SinkConfig {
            watcher_mode: WatcherMode::Inline,
            wait_timeout_ms: 5_000,
            ..SinkConfig::default()
        });
        let frame = image(32, 32);
        feeder.submit(&frame.as_frame()).unwrap();
        let gate = control.gate().unwrap();

        // stands in for the engine's streaming thread crossing the watermarks
        let stop = Arc::new(AtomicBool::new(false));
        let toggler = {
            let gate = gate.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut flips = 0u32;
                while !stop.load(Ordering::Acquire) {
                    if rand::random_bool(0.5) {
                        gate.set_saturated();
                    } else {
                        gate.set_ready();
                    }
                    flips += 1;
                    std::thread::sleep(Duration::from_micros(rand::random_range(0..200)));
                }
                gate.set_ready();
                flips
            })
        };

        // A saturation landing between the gate check and the ingest call is
        // tolerated: the engine queue still bounds memory, and the next
        // submission waits again. What must hold is that every waiter is
        // released and nothing is lost.
        for _ in 0..300 {
            assert_eq!(feeder.submit(&frame.as_frame()), Ok(SubmitOutcome::Submitted));
        }
        stop.store(true, Ordering::Release);
        assert!(toggler.join().unwrap() > 0);

        assert_eq!(control.log().ingested.len(), 301);
        assert_eq!(feeder.health.frame_drops(), 0);
        assert_eq!(gate.state(), GateState::Ready);
    }

    #[test]
    fn test_teardown_releases_blocked_producer() {
        let (engine, control) = MockEngine::new();
        let health = Arc::new(PipelineHealth::new());
        let watcher = ErrorWatcher::new(WatcherMode::Inline, health.clone()).unwrap();
        let gates = Arc::new(GateSlot::new());
        let manager = PipelineManager::new(engine, watcher, gates.clone(), health);
        let mut feeder = FrameFeeder::new(
            manager,
            SinkConfig {
                wait_timeout_ms: 60_000,
                ..SinkConfig::default()
            },
        );

        let frame = image(16, 16);
        feeder.submit(&frame.as_frame()).unwrap();
        control.gate().unwrap().set_saturated();

        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            gates.shutdown();
        });

        let started = std::time::Instant::now();
        assert_eq!(feeder.submit(&frame.as_frame()), Err(SinkError::GateClosed));
        assert!(started.elapsed() < Duration::from_secs(10));
        closer.join().unwrap();

        // no pipeline may come back after the slot was shut
        feeder.shutdown();
        assert_eq!(feeder.submit(&frame.as_frame()), Err(SinkError::Closed));
        assert_eq!(control.log().live_handles, 0);
    }
}
