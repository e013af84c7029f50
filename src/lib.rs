//! # Experiment Driver Library
//!
//! This crate executes experiment plans against a piece of apparatus. A plan is
//! an ordered list of segments, each ended by a predicate on a live signal
//! (temperature, pressure, load...), guarded by abort conditions that stop the
//! whole run when their own predicates become satisfied.
//!
//! ## Crate Structure
//!
//! - **`experiment`**: The plan model, the driver state machine
//!   (`zero`/`start`/`pause`/`resume`/`abort`), the segment executor, abort
//!   condition monitors, triggers, records and plan recorders.
//! - **`signal`**: The `SignalSource` abstraction, a name-keyed registry, a
//!   push/poll watcher and simulated signals.
//! - **`hardware`**: Capability traits implemented by apparatus bindings, plus
//!   mock implementations for tests and demos.
//! - **`config`**: Layered configuration loaded with `figment`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The crate-wide `DriverError` enum.
//!
//! ## Example
//!
//! ```rust,ignore
//! use experiment_driver::prelude::*;
//!
//! let temperature = ObservableSignal::new("T", 20.0);
//! let signals = SignalRegistry::new().with(Arc::new(temperature.clone()));
//!
//! let driver = ExperimentDriver::new(MockApparatus::new("furnace"), signals);
//! driver
//!     .load_plan(
//!         ExperimentPlan::builder("heat")
//!             .signal("T")
//!             .segment("ramp", LimitCondition::at_least(100.0))
//!             .build()?,
//!     )
//!     .await?;
//! driver.start().await?;
//! ```

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod signal;

pub use error::{DriverError, DriverResult};
pub use experiment::{DriverState, ExperimentDriver, ExperimentPlan};

/// Commonly used types.
pub mod prelude {
    pub use crate::config::DriverConfig;
    pub use crate::error::{DriverError, DriverResult};
    pub use crate::experiment::{
        AbortCondition, AbortReason, DriverState, ExperimentDriver, ExperimentPlan,
        ExperimentRecord, LimitCondition, MemoryRecorder, Operation, PlanRecorder, RunOutcome,
        Segment, SegmentRecord,
    };
    pub use crate::hardware::{Apparatus, MockApparatus, Triggerable};
    pub use crate::signal::{ObservableSignal, SignalRegistry, SignalSource};
    pub use std::sync::Arc;
}
