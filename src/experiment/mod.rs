//! Experiment plan execution.
//!
//! This module contains the plan model and the engine that executes it:
//! - Plan model: [`ExperimentPlan`], [`Segment`], [`AbortCondition`], [`TriggerSpec`]
//! - Driver: [`ExperimentDriver`] with the IDLE / RUNNING / PAUSED state machine
//! - Records: [`SegmentRecord`], [`ExperimentRecord`]
//! - Recording: the [`PlanRecorder`] trait and its implementations

pub mod limit;
pub mod plan;
pub mod record;
pub mod recorder;
pub mod state;

mod abort;
mod driver;
mod event;
mod executor;
mod trigger;

pub use driver::{DriverBuilder, ExperimentDriver};
pub use executor::SegmentClock;
pub use limit::{Comparator, LimitCondition};
pub use plan::{AbortCondition, ExperimentPlan, PlanBuilder, Segment, TriggerKind, TriggerSpec};
pub use record::{
    AbortReason, ExperimentRecord, OpenSegmentRecord, RunOutcome, SegmentRecord, TriggerRecord,
};
pub use recorder::{BroadcastRecorder, MemoryRecorder, PlanEvent, PlanRecorder, TracingRecorder};
pub use state::{DriverState, Operation};
