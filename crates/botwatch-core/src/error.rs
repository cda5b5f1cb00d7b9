//! # Error Types
//!
//! Domain-specific error types for botwatch-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  botwatch-core errors (this file)                                      │
//! │  └── CoreError        - Rejected state transitions, bad query shapes   │
//! │                                                                         │
//! │  botwatch-sync errors (separate crate)                                 │
//! │  ├── SyncError        - Transport, config and store failures           │
//! │  └── FetchError       - Both sources exhausted for a read              │
//! │                                                                         │
//! │  Flow: CoreError → SyncError → FetchError → Consumer                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Normalization never produces an error: missing optional data resolves to
//! a documented default instead (see [`crate::normalize`]).

use thiserror::Error;

use crate::reconcile::{SyncAction, SyncPhase};

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// The reconciliation machine cannot apply an action in its current phase.
    ///
    /// ## When This Occurs
    /// - `Success` / `Failure` arrives while no manual sync is in flight
    /// - `Start` arrives while a sync is already running
    ///
    /// The state is left unchanged; the caller decides whether to log it.
    #[error("Cannot apply {action} while {phase}")]
    InvalidTransition { phase: SyncPhase, action: &'static str },

    /// A query shape is malformed.
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl CoreError {
    /// Builds an [`CoreError::InvalidTransition`] for an action.
    pub fn invalid_transition(phase: SyncPhase, action: &SyncAction) -> Self {
        CoreError::InvalidTransition {
            phase,
            action: action.name(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidTransition {
            phase: SyncPhase::Idle,
            action: "SYNC_SUCCESS",
        };
        assert_eq!(err.to_string(), "Cannot apply SYNC_SUCCESS while idle");

        let err = CoreError::InvalidQuery {
            reason: "collection is required".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid query: collection is required");
    }
}
