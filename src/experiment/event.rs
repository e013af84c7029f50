//! Messages from monitoring tasks to the driver, and the pause gate those
//! tasks observe.
//!
//! Monitoring tasks never touch driver state. They push [`RunEvent`]s onto the
//! run's channel and the driver's supervisor applies them one at a time under
//! the transition lock.

use crate::error::DriverResult;
use crate::signal::SignalWatcher;
use tokio::sync::watch;

/// Something a monitoring task observed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunEvent {
    /// The termination predicate of segment `index` was satisfied.
    SegmentTerminated { index: usize, value: f64 },
    /// An abort condition's predicate became satisfied.
    ConditionFired { condition: String, value: f64 },
    /// A trigger enabled by segment `index` fired.
    TriggerFired {
        index: usize,
        trigger: String,
        value: f64,
    },
    /// A non-fatal problem to report to the recorder.
    Warning { message: String },
}

/// Read side of the run's paused flag.
#[derive(Debug, Clone)]
pub(crate) struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the run is not paused. Returns whether it had to wait.
    pub(crate) async fn running(&mut self) -> bool {
        let mut waited = false;
        while *self.rx.borrow_and_update() {
            waited = true;
            if self.rx.changed().await.is_err() {
                // Run torn down; the task is about to be aborted
                std::future::pending::<()>().await;
            }
        }
        waited
    }

    /// Wait until the run is paused.
    pub(crate) async fn paused(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Next value of `watcher` observed while the run is not paused.
///
/// A pending observation is dropped when a pause starts. After a resume the
/// watcher is rewound, so the value current at resume time is observed
/// straight away and a change made during the pause is not lost.
pub(crate) async fn observe_running(
    watcher: &mut SignalWatcher,
    gate: &mut PauseGate,
) -> DriverResult<f64> {
    loop {
        if gate.running().await {
            watcher.rewind();
        }
        tokio::select! {
            biased;
            _ = gate.paused() => continue,
            observed = watcher.next() => {
                if gate.is_paused() {
                    watcher.rewind();
                    continue;
                }
                return observed;
            }
        }
    }
}
