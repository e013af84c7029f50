//! Triggers: actions fired while a segment runs.
//!
//! A trigger is enabled when a segment that lists it opens and disabled when
//! that segment closes. Enabling a trigger again in a later segment starts it
//! from scratch. Triggers are suspended while the driver is paused.
//!
//! - `Position` fires every time its signal has moved by at least `interval`
//!   since the previous firing (the first observed value is the reference)
//! - `SingleFire` fires once, the first time its signal is within `tolerance`
//!   of `target`
//! - `Timed` fires every `period` of running time; its triggering signal is
//!   the elapsed time in milliseconds since it was enabled

use crate::experiment::event::{observe_running, PauseGate, RunEvent};
use crate::experiment::plan::{TriggerKind, TriggerSpec};
use crate::hardware::Triggerable;
use crate::signal::SignalWatcher;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Relative slack on position intervals, so that a move of exactly one
/// interval fires despite floating point rounding.
const INTERVAL_ROUNDING: f64 = 1e-9;

/// Firing rule state of one enabled trigger.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TriggerEvaluator {
    Position {
        interval: f64,
        reference: Option<f64>,
    },
    SingleFire {
        target: f64,
        tolerance: f64,
        fired: bool,
    },
    Timed {
        period: f64,
        next: f64,
    },
}

impl TriggerEvaluator {
    pub(crate) fn new(kind: &TriggerKind) -> Self {
        match kind {
            TriggerKind::Position { interval, .. } => TriggerEvaluator::Position {
                interval: *interval,
                reference: None,
            },
            TriggerKind::SingleFire {
                target, tolerance, ..
            } => TriggerEvaluator::SingleFire {
                target: *target,
                tolerance: *tolerance,
                fired: false,
            },
            TriggerKind::Timed { period } => TriggerEvaluator::Timed {
                period: period.as_secs_f64(),
                next: period.as_secs_f64(),
            },
        }
    }

    /// Feed one observation; returns the triggering signal if the trigger fires.
    ///
    /// Timed triggers observe the segment clock in seconds.
    pub(crate) fn observe(&mut self, value: f64) -> Option<f64> {
        if value.is_nan() {
            return None;
        }
        match self {
            TriggerEvaluator::Position {
                interval,
                reference,
            } => match *reference {
                None => {
                    *reference = Some(value);
                    None
                }
                Some(previous)
                    if (value - previous).abs() >= *interval * (1.0 - INTERVAL_ROUNDING) =>
                {
                    *reference = Some(value);
                    Some(value)
                }
                Some(_) => None,
            },
            TriggerEvaluator::SingleFire {
                target,
                tolerance,
                fired,
            } => {
                if !*fired && (value - *target).abs() <= *tolerance {
                    *fired = true;
                    Some(value)
                } else {
                    None
                }
            }
            TriggerEvaluator::Timed { period, next } => {
                if value < *next {
                    return None;
                }
                // Periods missed between two observations collapse into one firing
                while *next <= value {
                    *next += *period;
                }
                Some(value * 1000.0)
            }
        }
    }

    /// Whether the trigger can never fire again.
    pub(crate) fn is_spent(&self) -> bool {
        matches!(self, TriggerEvaluator::SingleFire { fired: true, .. })
    }
}

/// Everything an enabled trigger's task needs.
pub(crate) struct TriggerTask {
    pub(crate) index: usize,
    pub(crate) spec: TriggerSpec,
    pub(crate) watcher: SignalWatcher,
    pub(crate) gate: PauseGate,
    pub(crate) events: mpsc::Sender<RunEvent>,
    pub(crate) action: Option<Arc<dyn Triggerable>>,
}

impl TriggerTask {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut evaluator = TriggerEvaluator::new(&self.spec.kind);
        let mut unavailable = false;
        debug!(trigger = %self.spec.name, segment = self.index, "Trigger enabled");

        loop {
            let value = match observe_running(&mut self.watcher, &mut self.gate).await {
                Ok(value) => {
                    unavailable = false;
                    value
                }
                Err(e) => {
                    if !unavailable {
                        unavailable = true;
                        warn!(trigger = %self.spec.name, error = %e, "Trigger cannot be evaluated");
                        let event = RunEvent::Warning {
                            message: format!("Trigger '{}': {}", self.spec.name, e),
                        };
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
            };

            if let Some(triggering_signal) = evaluator.observe(value) {
                let event = RunEvent::TriggerFired {
                    index: self.index,
                    trigger: self.spec.name.clone(),
                    value: triggering_signal,
                };
                if self.events.send(event).await.is_err() {
                    return;
                }

                if let Some(action) = &self.action {
                    if let Err(e) = action.trigger(triggering_signal).await {
                        warn!(trigger = %self.spec.name, error = %e, "Trigger action failed");
                        let event = RunEvent::Warning {
                            message: format!("Trigger '{}' action failed: {:#}", self.spec.name, e),
                        };
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            if evaluator.is_spent() {
                debug!(trigger = %self.spec.name, "Single-fire trigger spent");
                return;
            }
        }
    }
}
