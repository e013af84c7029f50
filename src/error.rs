//! Custom error types for the experiment driver.
//!
//! This module defines the primary error type, `DriverError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report what went wrong when the control surface drives a plan.
//!
//! ## Error Hierarchy
//!
//! `DriverError` consolidates the failure modes of plan execution:
//!
//! - **`InvalidTransition`**: An operation was called from a state that does not permit
//!   it (e.g. `start()` while already running). Always surfaced to the caller and never
//!   changes state.
//! - **`HookFailure`**: The apparatus binding failed while executing one of its hooks.
//!   The attempted transition did not happen; the driver is left exactly where it was.
//! - **`SignalUnavailable`**: A signal source could not supply a value. Monitoring tasks
//!   absorb this and retry on the next observation; it only reaches callers from
//!   explicit lookups such as [`crate::signal::SignalRegistry::resolve`].
//! - **`InvalidPlan`**: The plan handed over by the setup flow failed validation.
//! - **`NoPlanLoaded`**: `start()` was called before any plan was loaded.
//! - **`Config`**: Wraps errors from `figment` while loading configuration.
//!
//! Only `InvalidTransition` and `HookFailure` are produced by the five state machine
//! operations themselves (plus `NoPlanLoaded` from `start()`).

use crate::experiment::state::{DriverState, Operation};
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Primary error type for the experiment driver.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Operation called from a state that does not permit it.
    #[error("Method {operation} can only be called from: {allowed} (driver is {state})")]
    InvalidTransition {
        /// The rejected operation
        operation: Operation,
        /// State the driver was in when the call was evaluated
        state: DriverState,
        /// Comma separated list of states the operation is allowed from
        allowed: String,
    },

    /// An apparatus hook raised an error; the transition did not happen.
    #[error("Apparatus hook '{hook}' failed: {source}")]
    HookFailure {
        /// Name of the hook (`do_start`, `do_abort`, ...)
        hook: &'static str,
        /// Error reported by the apparatus binding
        #[source]
        source: anyhow::Error,
    },

    /// A signal source could not supply a value.
    #[error("Signal '{signal}' unavailable: {reason}")]
    SignalUnavailable {
        /// Name of the signal source
        signal: String,
        /// Why no value could be read
        reason: String,
    },

    /// The plan failed validation.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// No plan has been loaded into the driver.
    #[error("No plan loaded")]
    NoPlanLoaded,

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl DriverError {
    /// Build an `InvalidTransition` for `operation` attempted from `state`.
    pub fn invalid_transition(operation: Operation, state: DriverState) -> Self {
        let allowed = operation
            .allowed_from()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        DriverError::InvalidTransition {
            operation,
            state,
            allowed,
        }
    }

    /// Build a `SignalUnavailable` from any displayable reason.
    pub fn signal_unavailable(signal: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        DriverError::SignalUnavailable {
            signal: signal.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is an `InvalidTransition`.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, DriverError::InvalidTransition { .. })
    }

    /// Whether this error is a `HookFailure`.
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, DriverError::HookFailure { .. })
    }
}

impl From<figment::Error> for DriverError {
    fn from(err: figment::Error) -> Self {
        DriverError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_lists_allowed_states() {
        let err = DriverError::invalid_transition(Operation::Abort, DriverState::Idle);
        assert_eq!(
            err.to_string(),
            "Method abort can only be called from: RUNNING, PAUSED (driver is IDLE)"
        );
        assert!(err.is_invalid_transition());
        assert!(!err.is_hook_failure());
    }

    #[test]
    fn hook_failure_keeps_source() {
        let err = DriverError::HookFailure {
            hook: "do_start",
            source: anyhow::anyhow!("shutter jammed"),
        };
        assert!(err.is_hook_failure());
        assert!(err.to_string().contains("shutter jammed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
