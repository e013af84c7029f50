//! Simulated signal sources for tests and demos.
//!
//! All of these are pull-based: their value evolves on every `read()`.

use super::SignalSource;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Signal which evolves linearly with each read.
///
/// The first read returns `start + step`. Use a negative step for a
/// decreasing signal.
pub struct LinearSignal {
    name: String,
    position: Mutex<f64>,
    step: f64,
}

impl LinearSignal {
    /// Create a linear ramp.
    pub fn new(name: impl Into<String>, start: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new(start),
            step,
        }
    }
}

#[async_trait]
impl SignalSource for LinearSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<f64> {
        let mut position = self.position.lock();
        *position += self.step;
        Ok(*position)
    }
}

/// Signal computed as `f(x)` where `x` counts reads (1, 2, 3, ...).
pub struct FunctionSignal {
    name: String,
    x: Mutex<f64>,
    function: Box<dyn Fn(f64) -> f64 + Send + Sync>,
}

impl FunctionSignal {
    /// Create a signal from a function of the read count.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            x: Mutex::new(0.0),
            function: Box::new(function),
        }
    }
}

#[async_trait]
impl SignalSource for FunctionSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<f64> {
        let x = {
            let mut x = self.x.lock();
            *x += 1.0;
            *x
        };
        Ok((self.function)(x))
    }
}

/// Replays a fixed list of values, then holds the last one.
pub struct SequenceSignal {
    name: String,
    values: Vec<f64>,
    index: Mutex<usize>,
}

impl SequenceSignal {
    /// Create a signal that yields `values` in order.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            index: Mutex::new(0),
        }
    }
}

#[async_trait]
impl SignalSource for SequenceSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<f64> {
        let last = self
            .values
            .len()
            .checked_sub(1)
            .ok_or_else(|| anyhow!("sequence '{}' is empty", self.name))?;
        let mut index = self.index.lock();
        let value = self.values[(*index).min(last)];
        *index += 1;
        Ok(value)
    }
}
