//! Abort condition monitors.
//!
//! Activating a plan's abort conditions spawns one task per condition. Each
//! task watches its signal source for the whole run, paused or not, and
//! reports [`RunEvent::ConditionFired`] when its predicate becomes satisfied.
//!
//! Monitors are edge-triggered: after firing, a condition only fires again
//! once its predicate has been observed unsatisfied. Deactivation aborts the
//! tasks and waits for them to finish, so no monitor outlives the run that
//! activated it.

use crate::error::DriverResult;
use crate::experiment::event::RunEvent;
use crate::experiment::plan::AbortCondition;
use crate::signal::{SignalRegistry, SignalWatcher};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ConditionMonitor {
    name: String,
    handle: JoinHandle<()>,
}

/// The active abort conditions of one run.
#[derive(Default)]
pub(crate) struct AbortMonitors {
    monitors: Vec<ConditionMonitor>,
}

impl AbortMonitors {
    /// Activate every condition.
    ///
    /// Either every condition ends up active or none does: if a signal source
    /// cannot be resolved, the monitors spawned so far are stopped again.
    pub(crate) async fn activate(
        conditions: &[AbortCondition],
        signals: &SignalRegistry,
        poll_interval: Duration,
        events: &mpsc::Sender<RunEvent>,
    ) -> DriverResult<Self> {
        let mut active = Self::default();
        for condition in conditions {
            let source = match signals.resolve(&condition.signal) {
                Ok(source) => source,
                Err(e) => {
                    active.deactivate().await;
                    return Err(e);
                }
            };
            let watcher = SignalWatcher::new(source, poll_interval);
            let handle = tokio::spawn(monitor(condition.clone(), watcher, events.clone()));
            active.monitors.push(ConditionMonitor {
                name: condition.name.clone(),
                handle,
            });
        }
        debug!(count = active.monitors.len(), "Abort conditions activated");
        Ok(active)
    }

    /// Names of the active conditions.
    pub(crate) fn names(&self) -> Vec<String> {
        self.monitors.iter().map(|m| m.name.clone()).collect()
    }

    /// Whether any condition is active.
    pub(crate) fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Stop every monitor without waiting.
    pub(crate) fn abort_all(&self) {
        for monitor in &self.monitors {
            monitor.handle.abort();
        }
    }

    /// Stop every monitor and wait until none is running.
    pub(crate) async fn deactivate(&mut self) {
        self.abort_all();
        for monitor in self.monitors.drain(..) {
            // Cancellation is the expected outcome
            let _ = monitor.handle.await;
        }
    }
}

impl Drop for AbortMonitors {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn monitor(condition: AbortCondition, mut watcher: SignalWatcher, events: mpsc::Sender<RunEvent>) {
    let mut armed = true;
    let mut unavailable = false;

    loop {
        match watcher.next().await {
            Ok(value) => {
                if unavailable {
                    info!(condition = %condition.name, signal = %condition.signal, "Signal available again");
                    unavailable = false;
                }

                let satisfied = condition.limit.is_satisfied(value);
                if satisfied && armed {
                    armed = false;
                    info!(
                        condition = %condition.name,
                        predicate = %condition.limit.describe(&condition.signal),
                        value,
                        "Abort condition fired"
                    );
                    let event = RunEvent::ConditionFired {
                        condition: condition.name.clone(),
                        value,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                } else if !satisfied {
                    armed = true;
                }
            }
            Err(e) => {
                if !unavailable {
                    unavailable = true;
                    warn!(condition = %condition.name, error = %e, "Abort condition cannot be evaluated");
                    let event = RunEvent::Warning {
                        message: format!("Abort condition '{}': {}", condition.name, e),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::limit::LimitCondition;
    use crate::signal::ObservableSignal;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn setup() -> (ObservableSignal, SignalRegistry, Vec<AbortCondition>) {
        let pressure = ObservableSignal::new("P", 1.0);
        let registry = SignalRegistry::new().with(Arc::new(pressure.clone()));
        let conditions = vec![AbortCondition::new("vacuum", "P", LimitCondition::below(0.0))];
        (pressure, registry, conditions)
    }

    async fn next_event(rx: &mut mpsc::Receiver<RunEvent>) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn fires_once_per_crossing() {
        let (pressure, registry, conditions) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitors = AbortMonitors::activate(&conditions, &registry, Duration::from_millis(5), &tx)
            .await
            .unwrap();
        assert_eq!(monitors.names(), vec!["vacuum".to_string()]);

        pressure.set(-1.0);
        assert_eq!(
            next_event(&mut rx).await,
            RunEvent::ConditionFired {
                condition: "vacuum".into(),
                value: -1.0
            }
        );

        // Still satisfied: no second firing
        pressure.set(-2.0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        // Re-armed after going unsatisfied
        pressure.set(1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        pressure.set(-3.0);
        assert!(matches!(
            next_event(&mut rx).await,
            RunEvent::ConditionFired { value, .. } if value == -3.0
        ));

        monitors.deactivate().await;
        assert!(monitors.is_empty());
    }

    #[tokio::test]
    async fn deactivated_monitor_never_fires() {
        let (pressure, registry, conditions) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitors = AbortMonitors::activate(&conditions, &registry, Duration::from_millis(5), &tx)
            .await
            .unwrap();

        monitors.deactivate().await;
        pressure.set(-1.0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn unavailable_signal_is_reported_once() {
        let pressure = ObservableSignal::unavailable("P");
        let registry = SignalRegistry::new().with(Arc::new(pressure.clone()));
        let conditions = vec![AbortCondition::new("vacuum", "P", LimitCondition::below(0.0))];
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitors = AbortMonitors::activate(&conditions, &registry, Duration::from_millis(5), &tx)
            .await
            .unwrap();

        assert!(matches!(next_event(&mut rx).await, RunEvent::Warning { .. }));
        assert!(logs_contain("Abort condition cannot be evaluated"));
        pressure.set_unavailable();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        pressure.set(-5.0);
        assert!(matches!(
            next_event(&mut rx).await,
            RunEvent::ConditionFired { .. }
        ));
        assert!(logs_contain("Signal available again"));
        monitors.deactivate().await;
    }

    #[tokio::test]
    async fn unknown_signal_activates_nothing() {
        let (_pressure, registry, mut conditions) = setup();
        conditions.push(AbortCondition::new("leak", "missing", LimitCondition::above(1.0)));
        let (tx, _rx) = mpsc::channel(8);
        let result = AbortMonitors::activate(&conditions, &registry, Duration::from_millis(5), &tx).await;
        assert!(result.is_err());
    }
}
