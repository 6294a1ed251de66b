//! Error types for the scheduler module

use std::fmt;

use uuid::Uuid;

use super::state::RunPhase;
use crate::error::ErrorClass;
use crate::models::{TargetError, TargetKey};

/// Result type for scheduler operations
pub type RunResult<T> = Result<T, RunError>;

/// Run lifecycle errors
///
/// Only raised when a run cannot be armed or addressed. Failures during a
/// burst are recorded on the run status instead.
#[derive(Debug)]
pub enum RunError {
    /// Target is missing a field the endpoints need
    InvalidTarget(TargetError),

    /// Another run for the same target is still active
    AlreadyActive { key: TargetKey, run_id: Uuid },

    /// No run with this id
    NotFound(Uuid),

    /// Phase change not permitted by the state machine
    InvalidTransition { from: RunPhase, to: RunPhase },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget(e) => write!(f, "Invalid target: {e}"),
            Self::AlreadyActive { key, run_id } => {
                write!(f, "Target {key} already has an active run ({run_id})")
            }
            Self::NotFound(id) => write!(f, "Run not found: {id}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid transition from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidTarget(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TargetError> for RunError {
    fn from(err: TargetError) -> Self {
        Self::InvalidTarget(err)
    }
}

impl RunError {
    /// Create an invalid transition error
    pub fn invalid_transition(from: RunPhase, to: RunPhase) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Whether retrying the same request could succeed later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyActive { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTarget(_) => ErrorClass::Config,
            Self::AlreadyActive { .. } | Self::NotFound(_) | Self::InvalidTransition { .. } => {
                ErrorClass::Other
            }
        }
    }
}
