//! Display backend plumbing
//!
//! The host selects a display module by name (`video_display gst_v4l2_sink,...`).
//! [`BackendRegistry`] holds the registered backends with explicit init and
//! shutdown hooks; [`V4l2SinkBackend`] is the one backend this crate ships,
//! generic over the engine so the pipeline layer can run without GStreamer.

use anyhow::{Context, bail};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{BACKEND_NAME, DisplaySpec, SinkConfig};
use crate::error::{Result, SinkError};
use crate::frame::VideoFrame;
use crate::pipeline::engine::PipelineEngine;
use crate::pipeline::feeder::SubmitOutcome;
use crate::sink::SinkSession;

/// Produces engines for new sessions and owns process wide engine setup
pub trait EngineFactory: Send + Sync {
    type Engine: PipelineEngine + 'static;

    /// One time library setup, run when the backend is registered
    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn deinitialize(&self) {}

    fn create(&self) -> anyhow::Result<Self::Engine>;
}

/// An open display, as seen by the host
pub trait DisplaySession: Send + Sync {
    /// `title` is the host's window title, unused by device sinks
    fn display(&self, title: &str, frame: &VideoFrame<'_>) -> Result<SubmitOutcome>;

    fn reset(&self) -> Result<()>;

    fn close(&self);
}

pub trait DisplayBackend: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> anyhow::Result<()>;

    fn deinit(&self);

    fn open(&self, config: SinkConfig) -> anyhow::Result<Box<dyn DisplaySession>>;
}

impl<E: PipelineEngine + 'static> DisplaySession for SinkSession<E> {
    fn display(&self, _title: &str, frame: &VideoFrame<'_>) -> Result<SubmitOutcome> {
        SinkSession::display(self, frame)
    }

    fn reset(&self) -> Result<()> {
        SinkSession::reset(self)
    }

    fn close(&self) {
        SinkSession::close(self)
    }
}

/// V4L2 loopback output through an `appsrc ! capsfilter ! v4l2sink` pipeline
pub struct V4l2SinkBackend<F: EngineFactory> {
    factory: F,
    initialized: AtomicBool,
}

impl<F: EngineFactory> V4l2SinkBackend<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Open a session with its concrete type, bypassing the registry
    pub fn open_session(&self, config: SinkConfig) -> anyhow::Result<SinkSession<F::Engine>> {
        if !self.initialized.load(Ordering::Acquire) {
            bail!("{} backend used before init", BACKEND_NAME);
        }
        let engine = self
            .factory
            .create()
            .context("Failed to create pipeline engine")?;
        Ok(SinkSession::open(engine, config)?)
    }
}

impl<F: EngineFactory> DisplayBackend for V4l2SinkBackend<F> {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn init(&self) -> anyhow::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.factory
            .initialize()
            .context("Failed to initialize media engine")?;
        self.initialized.store(true, Ordering::Release);
        debug!("V4l2SinkBackend: initialized");
        Ok(())
    }

    fn deinit(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.factory.deinitialize();
            debug!("V4l2SinkBackend: deinitialized");
        }
    }

    fn open(&self, config: SinkConfig) -> anyhow::Result<Box<dyn DisplaySession>> {
        Ok(Box::new(self.open_session(config)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    Uninitialized,
    Ready,
    ShutDown,
}

/// Named display backends with an explicit lifecycle
pub struct BackendRegistry {
    state: RegistryState,
    backends: Vec<Arc<dyn DisplayBackend>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            state: RegistryState::Uninitialized,
            backends: Vec::new(),
        }
    }

    /// Idempotent; a registry cannot come back after shutdown
    pub fn init(&mut self) -> anyhow::Result<()> {
        match self.state {
            RegistryState::Uninitialized => {
                self.state = RegistryState::Ready;
                info!("BackendRegistry: initialized");
                Ok(())
            }
            RegistryState::Ready => Ok(()),
            RegistryState::ShutDown => bail!("backend registry already shut down"),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == RegistryState::Ready
    }

    /// Register and initialize `backend`; returns false if the name is taken
    pub fn register(&mut self, backend: Arc<dyn DisplayBackend>) -> anyhow::Result<bool> {
        if self.state != RegistryState::Ready {
            bail!(
                "cannot register '{}': registry is {:?}",
                backend.name(),
                self.state
            );
        }
        if self.get(backend.name()).is_some() {
            debug!("BackendRegistry: '{}' already registered", backend.name());
            return Ok(false);
        }

        backend
            .init()
            .with_context(|| format!("Failed to initialize backend '{}'", backend.name()))?;
        info!("BackendRegistry: registered '{}'", backend.name());
        self.backends.push(backend);
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DisplayBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Open the backend named in a `video_display` value
    ///
    /// A device given in the value overrides the one in `config`.
    pub fn open(
        &self,
        spec: &DisplaySpec,
        mut config: SinkConfig,
    ) -> anyhow::Result<Box<dyn DisplaySession>> {
        if let Some(device) = &spec.device {
            config.device = Some(device.clone());
        }
        self.open_named(&spec.backend, config)
    }

    pub fn open_named(
        &self,
        name: &str,
        config: SinkConfig,
    ) -> anyhow::Result<Box<dyn DisplaySession>> {
        if self.state != RegistryState::Ready {
            return Err(SinkError::Closed.into());
        }
        let backend = self
            .get(name)
            .ok_or_else(|| SinkError::UnknownBackend(name.to_string()))?;
        backend.open(config)
    }

    /// Deinitialize backends in reverse registration order
    pub fn shutdown(&mut self) {
        if self.state == RegistryState::ShutDown {
            return;
        }
        for backend in self.backends.drain(..).rev() {
            backend.deinit();
        }
        self.state = RegistryState::ShutDown;
        info!("BackendRegistry: shut down");
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        if self.state == RegistryState::Ready {
            warn!("BackendRegistry: dropped without shutdown");
            self.shutdown();
        }
    }
}
