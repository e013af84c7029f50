//! Apparatus Bindings
//!
//! Capability traits implemented by the hardware an experiment drives, plus
//! mock implementations for tests and demos.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Apparatus, Triggerable};
pub use mock::{MockApparatus, MockTriggerable};
