use crate::RuntimeError;
use std::fmt;

/// Platform handler lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformState {
    Created,
    Setup,
    Running,
    TornDown,
}

impl fmt::Display for PlatformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Setup => write!(f, "setup"),
            Self::Running => write!(f, "running"),
            Self::TornDown => write!(f, "torn-down"),
        }
    }
}

/// Teardown is reachable from every live state so that cleanup can run after
/// a failure at any stage.
pub fn validate_transition(from: PlatformState, to: PlatformState) -> Result<(), RuntimeError> {
    let valid = matches!(
        (from, to),
        (PlatformState::Created, PlatformState::Setup)
            | (PlatformState::Setup, PlatformState::Running)
            | (
                PlatformState::Created | PlatformState::Setup | PlatformState::Running,
                PlatformState::TornDown
            )
    );

    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
