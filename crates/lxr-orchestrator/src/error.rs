//! Outcome types for a failed provisioning run

use lxr_core::{LifecycleState, LxrError};
use thiserror::Error;

/// What happened to the sandbox after a failed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing had been allocated
    NotRequired,
    /// The partial sandbox was stopped (best effort) and destroyed
    Destroyed,
    /// Destroy itself failed; the sandbox needs manual removal
    Failed(String),
}

impl std::fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRequired => write!(f, "not required"),
            Self::Destroyed => write!(f, "sandbox destroyed"),
            Self::Failed(reason) => write!(f, "destroy failed: {}", reason),
        }
    }
}

/// Error taxonomy reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Allocation,
    Stage,
    Timeout,
    Auth,
    NotFound,
    Transport,
    Interrupted,
}

/// Terminal error of a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Invalid request: {0}")]
    Validation(#[source] LxrError),

    /// Failed before any sandbox existed; nothing to clean up
    #[error("Allocation failed: {0}")]
    Allocation(#[source] LxrError),

    /// Failed after allocation; `stage` is the state that was not reached
    #[error("Stage {stage} failed: {source} (cleanup: {cleanup})")]
    Stage {
        stage: LifecycleState,
        #[source]
        source: LxrError,
        cleanup: CleanupOutcome,
    },
}

impl ProvisionError {
    /// Classify for reporting
    ///
    /// Timeouts, auth, not-found, transport and interrupt errors keep their
    /// own kind wherever they happened; other failures are attributed to the
    /// stage (or allocation) they occurred in.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Allocation(LxrError::Interrupted) => ErrorKind::Interrupted,
            Self::Allocation(LxrError::Validation(_)) => ErrorKind::Validation,
            Self::Allocation(_) => ErrorKind::Allocation,
            Self::Stage { source, .. } => match source {
                LxrError::Timeout { .. } => ErrorKind::Timeout,
                LxrError::Auth { .. } => ErrorKind::Auth,
                LxrError::NotFound { .. } => ErrorKind::NotFound,
                LxrError::Transport(_) => ErrorKind::Transport,
                LxrError::Interrupted => ErrorKind::Interrupted,
                _ => ErrorKind::Stage,
            },
        }
    }

    /// State the run was trying to reach, if a sandbox existed
    pub fn stage(&self) -> Option<LifecycleState> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn cleanup(&self) -> &CleanupOutcome {
        match self {
            Self::Stage { cleanup, .. } => cleanup,
            _ => &CleanupOutcome::NotRequired,
        }
    }

    /// The underlying error
    pub fn cause(&self) -> &LxrError {
        match self {
            Self::Validation(e) | Self::Allocation(e) => e,
            Self::Stage { source, .. } => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stage(source: LxrError) -> ProvisionError {
        ProvisionError::Stage {
            stage: LifecycleState::NetworkReady,
            source,
            cleanup: CleanupOutcome::Destroyed,
        }
    }

    #[test]
    fn test_kind_classification() {
        let timeout = LxrError::Timeout {
            target: "network".to_string(),
            attempts: 30,
            elapsed: Duration::from_secs(60),
            last_status: "cannot resolve".to_string(),
        };
        assert_eq!(stage(timeout).kind(), ErrorKind::Timeout);
        assert_eq!(
            stage(LxrError::Auth {
                message: "m".to_string(),
                body: "b".to_string()
            })
            .kind(),
            ErrorKind::Auth
        );
        assert_eq!(stage(LxrError::Transport("x".to_string())).kind(), ErrorKind::Transport);
        assert_eq!(stage(LxrError::Host("x".to_string())).kind(), ErrorKind::Stage);
        assert_eq!(stage(LxrError::Interrupted).kind(), ErrorKind::Interrupted);
        assert_eq!(
            ProvisionError::Allocation(LxrError::Host("pct create".to_string())).kind(),
            ErrorKind::Allocation
        );
        assert_eq!(
            ProvisionError::Allocation(LxrError::Interrupted).kind(),
            ErrorKind::Interrupted
        );
    }

    #[test]
    fn test_display_carries_stage_and_cleanup() {
        let err = ProvisionError::Stage {
            stage: LifecycleState::TokenObtained,
            source: LxrError::Transport("connection reset".to_string()),
            cleanup: CleanupOutcome::Failed("pct destroy exited 2".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("token_obtained"));
        assert!(msg.contains("connection reset"));
        assert!(msg.contains("destroy failed: pct destroy exited 2"));
        assert_eq!(err.stage(), Some(LifecycleState::TokenObtained));
    }

    #[test]
    fn test_allocation_needs_no_cleanup() {
        let err = ProvisionError::Allocation(LxrError::Host("no such storage".to_string()));
        assert_eq!(err.cleanup(), &CleanupOutcome::NotRequired);
        assert_eq!(err.stage(), None);
    }
}
