//! GStreamer implementation of the pipeline engine
//!
//! Builds `appsrc ! capsfilter ! v4l2sink` from the descriptor's launch line.
//! appsrc watermark signals drive the flow gate directly from GStreamer's
//! streaming threads; bus messages are inspected in a sync handler and
//! forwarded to the event observer, then dropped. appsrc runs with
//! `block=true`, so a push can stall on a full queue; closing the session
//! flushes appsrc to release it.

use anyhow::Context;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::glib::error::ErrorDomain;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info};
use std::sync::Arc;

use crate::backend::EngineFactory;
use crate::error::EngineError;
use crate::pipeline::engine::{
    EngineHandle, EngineState, IngestInterrupt, PipelineDescriptor, PipelineEngine, SOURCE_NAME,
};
use crate::pipeline::gate::FlowGate;
use crate::pipeline::packer::PackedBuffer;
use crate::pipeline::watcher::EventObserver;

/// Code for failures that carry no GStreamer error domain
const GENERIC_FAILURE: i32 = -1;

fn error_code(err: &glib::Error) -> i32 {
    if let Some(kind) = err.kind::<gst::ResourceError>() {
        kind.code()
    } else if let Some(kind) = err.kind::<gst::StreamError>() {
        kind.code()
    } else if let Some(kind) = err.kind::<gst::CoreError>() {
        kind.code()
    } else if let Some(kind) = err.kind::<gst::LibraryError>() {
        kind.code()
    } else if let Some(kind) = err.kind::<gst::ParseError>() {
        kind.code()
    } else {
        GENERIC_FAILURE
    }
}

fn engine_error(err: &glib::Error) -> EngineError {
    EngineError::new(error_code(err), err.message())
}

fn describe(err: &glib::Error, debug: Option<glib::GString>) -> String {
    match debug {
        Some(debug) => format!("{} ({})", err.message(), debug),
        None => err.message().to_string(),
    }
}

/// Registers GStreamer once for the process
#[derive(Debug, Default, Clone, Copy)]
pub struct GstEngineFactory;

impl EngineFactory for GstEngineFactory {
    type Engine = GstEngine;

    fn initialize(&self) -> anyhow::Result<()> {
        gst::init().context("GStreamer init failed")?;
        info!("GstEngine: GStreamer {} initialized", gst::version_string());
        Ok(())
    }

    fn deinitialize(&self) {
        // gst::deinit is unsafe while any object may still be alive
        debug!("GstEngine: deinitialize requested, GStreamer left loaded");
    }

    fn create(&self) -> anyhow::Result<GstEngine> {
        Ok(GstEngine)
    }
}

#[derive(Debug, Default)]
pub struct GstEngine;

impl PipelineEngine for GstEngine {
    type Handle = GstHandle;

    fn build(&mut self, descriptor: &PipelineDescriptor) -> Result<GstHandle, EngineError> {
        let line = descriptor.launch_line();
        debug!("GstEngine: launching '{}'", line);

        let pipeline = gst::parse::launch(&line)
            .map_err(|e| engine_error(&e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EngineError::new(GENERIC_FAILURE, "launch line did not yield a pipeline"))?;

        let Some(appsrc) = pipeline
            .by_name(SOURCE_NAME)
            .and_downcast::<gst_app::AppSrc>()
        else {
            return Err(EngineError::new(
                GENERIC_FAILURE,
                format!("no appsrc named '{}' in pipeline", SOURCE_NAME),
            ));
        };
        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::new(GENERIC_FAILURE, "pipeline has no bus"))?;

        Ok(GstHandle {
            pipeline,
            appsrc: Some(appsrc),
            bus: Some(bus),
        })
    }
}

pub struct GstHandle {
    pipeline: gst::Pipeline,
    appsrc: Option<gst_app::AppSrc>,
    bus: Option<gst::Bus>,
}

impl GstHandle {
    fn appsrc(&self) -> Result<&gst_app::AppSrc, EngineError> {
        self.appsrc
            .as_ref()
            .ok_or_else(|| EngineError::new(GENERIC_FAILURE, "ingest endpoint released"))
    }
}

impl EngineHandle for GstHandle {
    fn set_watermark_callbacks(&mut self, gate: Arc<FlowGate>) -> Result<(), EngineError> {
        let ready = gate.clone();
        let saturated = gate;
        self.appsrc()?.set_callbacks(
            gst_app::AppSrcCallbacks::builder()
                .need_data(move |_, _| ready.set_ready())
                .enough_data(move |_| saturated.set_saturated())
                .build(),
        );
        Ok(())
    }

    fn set_event_observer(&mut self, observer: EventObserver) -> Result<(), EngineError> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| EngineError::new(GENERIC_FAILURE, "bus released"))?;

        bus.set_sync_handler(move |_, msg| {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let error = err.error();
                    observer.fatal_error(error_code(&error), describe(&error, err.debug()));
                }
                gst::MessageView::Eos(_) => observer.end_of_stream(),
                gst::MessageView::Warning(warning) => {
                    observer.warning(describe(&warning.error(), warning.debug()))
                }
                _ => {}
            }
            gst::BusSyncReply::Drop
        });
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError> {
        let target = match state {
            EngineState::Null => gst::State::Null,
            EngineState::Playing => gst::State::Playing,
        };
        self.pipeline
            .set_state(target)
            .map(|_| ())
            .map_err(|e| EngineError::new(GENERIC_FAILURE, format!("{:?}: {}", target, e)))
    }

    fn ingest(&mut self, buffer: PackedBuffer) -> Result<(), EngineError> {
        let buffer = gst::Buffer::from_slice(buffer.into_bytes());
        self.appsrc()?
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| EngineError::new(e as i32, format!("push-buffer returned {:?}", e)))
    }

    fn ingest_interrupt(&self) -> Option<IngestInterrupt> {
        let appsrc = self.appsrc.clone()?;
        Some(Arc::new(move || {
            // flushing makes a push-buffer blocked on a full queue return
            if !appsrc.send_event(gst::event::FlushStart::new()) {
                debug!("GstEngine: flush-start not handled by {}", appsrc.name());
            }
        }))
    }

    fn release_ingest(&mut self) {
        if let Some(appsrc) = self.appsrc.take() {
            // watermark signals may still fire while the graph stops
            appsrc.set_callbacks(gst_app::AppSrcCallbacks::builder().build());
        }
    }

    fn clear_event_observer(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.unset_sync_handler();
        }
    }

    fn release(self) {
        debug!("GstEngine: releasing {}", self.pipeline.name());
    }
}
