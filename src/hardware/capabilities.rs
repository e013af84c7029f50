//! Apparatus Capabilities
//!
//! This module defines the capability traits a concrete apparatus binding implements
//! so the experiment driver can control it without knowing what it is:
//!
//! - A tensile rig implements `Apparatus` (its motor follows the plan)
//! - A detector implements `Triggerable` (it takes a measurement when a trigger fires)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! struct TensileRig {
//!     motor: MotorController,
//! }
//!
//! #[async_trait]
//! impl Apparatus for TensileRig {
//!     fn name(&self) -> &str { "tensile_rig" }
//!
//!     async fn do_zero(&self) -> Result<()> { self.motor.home().await }
//!     async fn do_start(&self) -> Result<()> { self.motor.run_profile().await }
//!     async fn do_pause(&self) -> Result<()> { self.motor.hold().await }
//!     async fn do_resume(&self) -> Result<()> { self.motor.release().await }
//!     async fn do_abort(&self) -> Result<()> { self.motor.stop().await }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Experiment Apparatus
///
/// The hardware the experiment driver controls (load frames, furnaces, pressure
/// cells). The driver calls exactly one hook per state transition, while holding
/// its transition lock.
///
/// # Contract
/// - A hook returning `Err` means the transition did not happen; the driver
///   leaves its state unchanged and surfaces a `HookFailure`
/// - Hooks are never called concurrently with each other on the same driver
/// - The driver never retries a failed hook by itself
#[async_trait]
pub trait Apparatus: Send + Sync {
    /// Identifier of the apparatus (the plan's driver identifier).
    fn name(&self) -> &str;

    /// Reset the apparatus to its zero position.
    ///
    /// Only called while the driver is idle.
    async fn do_zero(&self) -> Result<()>;

    /// Begin driving the apparatus.
    ///
    /// Called after all abort conditions are armed and before the first
    /// segment opens.
    async fn do_start(&self) -> Result<()>;

    /// Hold the apparatus where it is.
    async fn do_pause(&self) -> Result<()>;

    /// Continue after a pause.
    async fn do_resume(&self) -> Result<()>;

    /// Stop driving the apparatus.
    ///
    /// Called on user abort, abort condition and plan completion.
    async fn do_abort(&self) -> Result<()>;
}

/// Capability: Triggered Action
///
/// Something that runs when a plan trigger fires (a detector exposure, a scan).
///
/// # Contract
/// - `trigger()` receives the signal value that caused the trigger
/// - Errors are reported to the plan recorder as warnings; they never stop the plan
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Run the action.
    async fn trigger(&self, triggering_signal: f64) -> Result<()>;
}
