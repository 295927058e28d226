//! Pipeline state management

use std::time::Instant;

/// Pipeline lifecycle state machine
///
/// `Absent → Building → Active → (Faulted | Absent)`. Teardown is legal from
/// every state and always lands in `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No engine handle exists
    Absent,

    /// Graph constructed, not yet playing
    Building,

    /// Pipeline is playing and accepting buffers
    Active {
        /// When the pipeline started playing
        started_at: Instant,
    },

    /// An unrecoverable fault was observed, waiting for teardown
    Faulted,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // Teardown
            (_, Absent) => true,

            (Absent, Building) => true,
            (Building, Active { .. }) => true,

            // Invalidation
            (Active { .. }, Faulted) => true,
            (Faulted, Faulted) => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Absent => "Absent",
            PipelineState::Building => "Building",
            PipelineState::Active { .. } => "Active",
            PipelineState::Faulted => "Faulted",
        }
    }

    /// Check if the pipeline accepts buffers
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineState::Active { .. })
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, PipelineState::Faulted)
    }

    /// Get the duration since the pipeline started playing
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Active { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
