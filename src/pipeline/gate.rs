//! Backpressure gate between the producer and the engine's queue
//!
//! The engine flips the gate from its own streaming thread when its internal
//! queue crosses the high (`set_saturated`) or low (`set_ready`) watermark,
//! while the producer blocks in [`FlowGate::wait_ready`] on the caller's
//! thread. Closing is terminal and releases every waiter.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current consumer-side state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Consumer can accept data
    Ready,
    /// Consumer signalled backpressure, producer must wait
    Saturated,
    /// Pipeline torn down, never leaves this state
    Closed,
}

/// Result of [`FlowGate::wait_ready`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Gate was already open
    ReadyNow,
    /// Producer waited and was released by the consumer draining
    Released,
    /// Gate was closed before or while waiting
    Closed,
    /// Consumer stayed saturated for the whole timeout
    TimedOut,
}

impl WaitOutcome {
    /// Whether the producer may hand over its buffer
    pub fn may_submit(&self) -> bool {
        matches!(self, WaitOutcome::ReadyNow | WaitOutcome::Released)
    }
}

#[derive(Debug)]
pub struct FlowGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl FlowGate {
    pub fn new() -> FlowGate {
        FlowGate {
            state: Mutex::new(GateState::Ready),
            condvar: Condvar::new(),
        }
    }

    // A panicking callback must not wedge the producer, the state is a plain enum
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> GateState {
        *self.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == GateState::Closed
    }

    /// High watermark crossed
    pub fn set_saturated(&self) {
        let mut state = self.lock();
        if *state == GateState::Ready {
            *state = GateState::Saturated;
        }
    }

    /// Low watermark crossed, wakes one blocked producer
    pub fn set_ready(&self) {
        let mut state = self.lock();
        if *state == GateState::Saturated {
            *state = GateState::Ready;
            self.condvar.notify_one();
        }
    }

    /// Terminal transition, wakes every waiter
    pub fn close(&self) {
        let mut state = self.lock();
        *state = GateState::Closed;
        self.condvar.notify_all();
    }

    /// Block while the consumer is saturated, at most for `timeout`
    pub fn wait_ready(&self, timeout: Duration) -> WaitOutcome {
        let state = self.lock();
        match *state {
            GateState::Ready => return WaitOutcome::ReadyNow,
            GateState::Closed => return WaitOutcome::Closed,
            GateState::Saturated => {}
        }

        // wait_timeout_while re-checks under the lock, so a set_ready() racing
        // with this call is never lost
        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| *s == GateState::Saturated)
            .unwrap_or_else(PoisonError::into_inner);

        match *state {
            GateState::Ready => WaitOutcome::Released,
            GateState::Closed => WaitOutcome::Closed,
            GateState::Saturated => WaitOutcome::TimedOut,
        }
    }
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}
