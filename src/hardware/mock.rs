//! Mock Apparatus Implementations
//!
//! Provides a simulated apparatus binding for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockApparatus` - Records every hook call; individual hooks can be made to fail
//! - `MockTriggerable` - Counts trigger invocations and remembers the triggering signals

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::experiment::state::Operation;
use crate::hardware::capabilities::{Apparatus, Triggerable};

// =============================================================================
// MockApparatus - Simulated Apparatus Binding
// =============================================================================

/// Mock apparatus with injectable hook failures
///
/// Simulates an apparatus with:
/// - Optional per-hook latency
/// - A call log shared between clones
/// - Per-operation failure switches
///
/// # Example
///
/// ```rust,ignore
/// let apparatus = MockApparatus::new("rig");
/// apparatus.fail_on(Operation::Start);
/// assert!(driver.start().await.unwrap_err().is_hook_failure());
/// assert_eq!(apparatus.calls(), vec![Operation::Start]);
/// ```
#[derive(Clone)]
pub struct MockApparatus {
    name: String,
    calls: Arc<Mutex<Vec<Operation>>>,
    failing: Arc<Mutex<HashSet<Operation>>>,
    latency: Duration,
}

impl MockApparatus {
    /// Create new mock apparatus with instant hooks
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            latency: Duration::ZERO,
        }
    }

    /// Create mock apparatus whose hooks each take `latency`
    pub fn with_latency(name: impl Into<String>, latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new(name)
        }
    }

    /// Make the hook for `operation` fail until [`recover`](Self::recover) is called
    pub fn fail_on(&self, operation: Operation) {
        self.failing.lock().insert(operation);
    }

    /// Make the hook for `operation` succeed again
    pub fn recover(&self, operation: Operation) {
        self.failing.lock().remove(&operation);
    }

    /// Every hook call so far, including failed ones, in call order
    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().clone()
    }

    /// Number of calls made to the hook for `operation`
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls.lock().iter().filter(|op| **op == operation).count()
    }

    async fn hook(&self, operation: Operation) -> Result<()> {
        self.calls.lock().push(operation);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.failing.lock().contains(&operation) {
            bail!("{}: simulated {} failure", self.name, operation.hook_name());
        }
        tracing::debug!(apparatus = %self.name, hook = operation.hook_name(), "Mock hook executed");
        Ok(())
    }
}

#[async_trait]
impl Apparatus for MockApparatus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn do_zero(&self) -> Result<()> {
        self.hook(Operation::Zero).await
    }

    async fn do_start(&self) -> Result<()> {
        self.hook(Operation::Start).await
    }

    async fn do_pause(&self) -> Result<()> {
        self.hook(Operation::Pause).await
    }

    async fn do_resume(&self) -> Result<()> {
        self.hook(Operation::Resume).await
    }

    async fn do_abort(&self) -> Result<()> {
        self.hook(Operation::Abort).await
    }
}

// =============================================================================
// MockTriggerable - Simulated Triggered Measurement
// =============================================================================

/// Mock triggered action that counts invocations
#[derive(Clone, Default)]
pub struct MockTriggerable {
    count: Arc<AtomicUsize>,
    signals: Arc<Mutex<Vec<f64>>>,
}

impl MockTriggerable {
    /// Create new counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the action ran
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Triggering signals received, in order
    pub fn signals(&self) -> Vec<f64> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl Triggerable for MockTriggerable {
    async fn trigger(&self, triggering_signal: f64) -> Result<()> {
        self.signals.lock().push(triggering_signal);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_apparatus_records_calls() {
        let apparatus = MockApparatus::new("rig");
        apparatus.do_zero().await.unwrap();
        apparatus.do_start().await.unwrap();
        apparatus.do_abort().await.unwrap();

        assert_eq!(
            apparatus.calls(),
            vec![Operation::Zero, Operation::Start, Operation::Abort]
        );
        assert_eq!(apparatus.call_count(Operation::Start), 1);
    }

    #[tokio::test]
    async fn test_mock_apparatus_failure_injection() {
        let apparatus = MockApparatus::new("rig");
        apparatus.fail_on(Operation::Pause);

        let err = apparatus.do_pause().await.unwrap_err();
        assert!(err.to_string().contains("do_pause"));

        apparatus.recover(Operation::Pause);
        assert!(apparatus.do_pause().await.is_ok());
        assert_eq!(apparatus.call_count(Operation::Pause), 2);
    }

    #[tokio::test]
    async fn test_mock_triggerable_counts() {
        let action = MockTriggerable::new();
        action.trigger(1.5).await.unwrap();
        action.trigger(3.0).await.unwrap();
        assert_eq!(action.count(), 2);
        assert_eq!(action.signals(), vec![1.5, 3.0]);
    }
}
