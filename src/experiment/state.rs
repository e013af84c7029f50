//! Driver state and the transition table.
//!
//! The driver exposes five operations to the control surface. Each one is only
//! legal from a fixed set of states and lands in exactly one target state:
//!
//! ```text
//!            zero()
//!           ┌──────┐
//!           ▼      │
//!        ┌──────┐──┘   start()    ┌─────────┐
//!        │ IDLE │────────────────▶│ RUNNING │
//!        └──────┘                 └─────────┘
//!           ▲  ▲     abort()       │     ▲
//!           │  └───────────────────┘     │
//!           │                   pause()  │ resume()
//!           │      abort()        ▼      │
//!           │                 ┌────────┐ │
//!           └─────────────────│ PAUSED │─┘
//!                             └────────┘
//! ```
//!
//! The table here is pure; the driver applies it under its transition lock
//! after the apparatus hook has succeeded.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};

/// Execution state of an experiment driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    /// No plan running. Initial and terminal state.
    #[default]
    Idle,
    /// Plan executing, abort conditions armed
    Running,
    /// Plan suspended, abort conditions still armed
    Paused,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Idle => write!(f, "IDLE"),
            DriverState::Running => write!(f, "RUNNING"),
            DriverState::Paused => write!(f, "PAUSED"),
        }
    }
}

impl DriverState {
    /// Whether a plan run is in progress (running or paused).
    ///
    /// Abort conditions must be active exactly when this is true.
    pub fn is_active(&self) -> bool {
        matches!(self, DriverState::Running | DriverState::Paused)
    }

    /// Check if the state allows starting a new run.
    pub fn can_start(&self) -> bool {
        Operation::Start.is_allowed_from(*self)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        Operation::Pause.is_allowed_from(*self)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        Operation::Resume.is_allowed_from(*self)
    }

    /// Check if the state allows aborting.
    pub fn can_abort(&self) -> bool {
        Operation::Abort.is_allowed_from(*self)
    }

    /// Apply `operation` to this state.
    ///
    /// Returns the resulting state, or `InvalidTransition` if the operation is
    /// not allowed from here.
    pub fn apply(self, operation: Operation) -> DriverResult<DriverState> {
        if operation.is_allowed_from(self) {
            Ok(operation.target())
        } else {
            Err(DriverError::invalid_transition(operation, self))
        }
    }
}

/// Operations of the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Reset the apparatus
    Zero,
    /// Arm abort conditions and begin the plan
    Start,
    /// Suspend segment evaluation
    Pause,
    /// Continue after a pause
    Resume,
    /// Stop the plan and disarm abort conditions
    Abort,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Operation::Zero => "zero",
            Operation::Start => "start",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Abort => "abort",
        };
        write!(f, "{}", label)
    }
}

impl Operation {
    /// All operations, in control surface order.
    pub const ALL: [Operation; 5] = [
        Operation::Zero,
        Operation::Start,
        Operation::Pause,
        Operation::Resume,
        Operation::Abort,
    ];

    /// States this operation may be called from.
    pub fn allowed_from(&self) -> &'static [DriverState] {
        match self {
            Operation::Zero | Operation::Start => &[DriverState::Idle],
            Operation::Pause => &[DriverState::Running],
            Operation::Resume => &[DriverState::Paused],
            Operation::Abort => &[DriverState::Running, DriverState::Paused],
        }
    }

    /// Whether this operation may be called from `state`.
    pub fn is_allowed_from(&self, state: DriverState) -> bool {
        self.allowed_from().contains(&state)
    }

    /// State the driver lands in after this operation succeeds.
    pub fn target(&self) -> DriverState {
        match self {
            Operation::Zero | Operation::Abort => DriverState::Idle,
            Operation::Start | Operation::Resume => DriverState::Running,
            Operation::Pause => DriverState::Paused,
        }
    }

    /// Name of the apparatus hook invoked by this operation.
    pub fn hook_name(&self) -> &'static str {
        match self {
            Operation::Zero => "do_zero",
            Operation::Start => "do_start",
            Operation::Pause => "do_pause",
            Operation::Resume => "do_resume",
            Operation::Abort => "do_abort",
        }
    }
}
