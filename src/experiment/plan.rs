//! Experiment plan definitions.
//!
//! An `ExperimentPlan` is the ordered list of segments an experiment runs
//! through, the abort conditions that guard the whole run, and the triggers
//! segments can enable. Plans are built by the setup flow (typically through
//! [`PlanBuilder`]), validated once, and then only read by the driver.

use crate::error::{DriverError, DriverResult};
use crate::experiment::limit::LimitCondition;
use crate::signal::{SignalRegistry, SEGMENT_TIME_SIGNAL};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// A unit of plan work, ended by a signal-based limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name, unique within the plan
    pub name: String,
    /// Name of the signal source watched for termination
    pub signal: String,
    /// Predicate ending the segment
    pub limit: LimitCondition,
    /// Names of the triggers enabled while this segment runs
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl Segment {
    /// Segment ending when `signal` satisfies `limit`.
    pub fn new(name: impl Into<String>, signal: impl Into<String>, limit: LimitCondition) -> Self {
        Self {
            name: name.into(),
            signal: signal.into(),
            limit,
            triggers: Vec::new(),
        }
    }

    /// Segment ending after `duration` of running (not paused) time.
    pub fn timed(name: impl Into<String>, duration: Duration) -> Self {
        Self::new(
            name,
            SEGMENT_TIME_SIGNAL,
            LimitCondition::at_least(duration.as_secs_f64()),
        )
    }

    /// Enable the named triggers while this segment runs.
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.extend(triggers.into_iter().map(Into::into));
        self
    }

    /// Whether this segment is bounded by the segment clock.
    pub fn is_timed(&self) -> bool {
        self.signal == SEGMENT_TIME_SIGNAL
    }
}

/// A standing predicate that stops the plan when satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortCondition {
    /// Condition name, unique within the plan
    pub name: String,
    /// Name of the watched signal source
    pub signal: String,
    /// Predicate that aborts the plan
    pub limit: LimitCondition,
}

impl AbortCondition {
    /// Abort when `signal` satisfies `limit`.
    pub fn new(name: impl Into<String>, signal: impl Into<String>, limit: LimitCondition) -> Self {
        Self {
            name: name.into(),
            signal: signal.into(),
            limit,
        }
    }
}

/// How a trigger decides to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fire every time the signal has moved by `interval` since the last firing.
    Position {
        /// Watched signal
        signal: String,
        /// Signal change between firings
        interval: f64,
    },
    /// Fire once when the signal comes within `tolerance` of `target`.
    SingleFire {
        /// Watched signal
        signal: String,
        /// Signal value to fire at
        target: f64,
        /// Allowed deviation from the target
        tolerance: f64,
    },
    /// Fire every `period` of running time.
    Timed {
        /// Time between firings
        #[serde(with = "duration_ms")]
        period: Duration,
    },
}

/// A named trigger definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Trigger name, unique within the plan
    pub name: String,
    /// Firing rule
    #[serde(flatten)]
    pub kind: TriggerKind,
}

impl TriggerSpec {
    /// Signal watched by this trigger, if it watches one.
    pub fn signal(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Position { signal, .. } | TriggerKind::SingleFire { signal, .. } => {
                Some(signal)
            }
            TriggerKind::Timed { .. } => None,
        }
    }
}

/// The full definition of an experiment run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    /// Plan name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Identifier of the apparatus this plan drives
    #[serde(default)]
    pub driver: String,
    /// Segments, in execution order
    pub segments: Vec<Segment>,
    /// Conditions guarding the whole run
    #[serde(default)]
    pub abort_conditions: Vec<AbortCondition>,
    /// Triggers segments may enable
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

impl ExperimentPlan {
    /// Start building a plan.
    pub fn builder(name: impl Into<String>) -> PlanBuilder {
        PlanBuilder::new(name)
    }

    /// Look up a trigger definition by name.
    pub fn trigger(&self, name: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.name == name)
    }

    /// Check the plan is runnable against `signals`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPlan` if:
    /// - The plan has no segments
    /// - Segment, abort condition or trigger names are not unique
    /// - A segment enables a trigger that is not defined
    /// - A referenced signal source is not registered
    pub fn validate(&self, signals: &SignalRegistry) -> DriverResult<()> {
        if self.segments.is_empty() {
            return Err(DriverError::InvalidPlan("No segments defined!".to_string()));
        }

        ensure_unique("Segments", self.segments.iter().map(|s| s.name.as_str()))?;
        ensure_unique(
            "Abort conditions",
            self.abort_conditions.iter().map(|c| c.name.as_str()),
        )?;
        ensure_unique("Triggers", self.triggers.iter().map(|t| t.name.as_str()))?;

        for segment in &self.segments {
            if !segment.is_timed() {
                ensure_signal(signals, &segment.signal, "segment", &segment.name)?;
            }
            for trigger in &segment.triggers {
                if self.trigger(trigger).is_none() {
                    return Err(DriverError::InvalidPlan(format!(
                        "Segment '{}' enables undefined trigger '{}'",
                        segment.name, trigger
                    )));
                }
            }
        }

        for condition in &self.abort_conditions {
            ensure_signal(signals, &condition.signal, "abort condition", &condition.name)?;
        }

        for trigger in &self.triggers {
            match &trigger.kind {
                TriggerKind::Position { signal, interval } => {
                    ensure_signal(signals, signal, "trigger", &trigger.name)?;
                    if interval.is_nan() || *interval <= 0.0 {
                        return Err(DriverError::InvalidPlan(format!(
                            "Trigger '{}' needs a positive interval",
                            trigger.name
                        )));
                    }
                }
                TriggerKind::SingleFire { signal, .. } => {
                    ensure_signal(signals, signal, "trigger", &trigger.name)?;
                }
                TriggerKind::Timed { period } => {
                    if period.is_zero() {
                        return Err(DriverError::InvalidPlan(format!(
                            "Trigger '{}' needs a non-zero period",
                            trigger.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn ensure_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> DriverResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DriverError::InvalidPlan(format!(
                "{} should have unique names! ('{}' is repeated)",
                what, name
            )));
        }
    }
    Ok(())
}

fn ensure_signal(signals: &SignalRegistry, signal: &str, kind: &str, owner: &str) -> DriverResult<()> {
    if signals.contains(signal) {
        Ok(())
    } else {
        Err(DriverError::InvalidPlan(format!(
            "{} '{}' watches unknown signal '{}'",
            kind, owner, signal
        )))
    }
}

/// Incremental plan construction.
///
/// Mirrors the registrar style of experiment scripts: declare a signal, then
/// add segments and triggers that implicitly use the most recently declared one.
///
/// ```rust,ignore
/// let plan = ExperimentPlan::builder("ramp and hold")
///     .driver("tensile_rig")
///     .signal("load")
///     .segment("ramp", LimitCondition::at_least(100.0))
///     .timed_segment("hold", Duration::from_secs(30))
///     .abort_condition("overload", "load", LimitCondition::above(150.0))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan: ExperimentPlan,
    last_signal: Option<String>,
    error: Option<String>,
}

impl PlanBuilder {
    /// New empty plan called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            plan: ExperimentPlan {
                name: name.into(),
                ..Default::default()
            },
            last_signal: None,
            error: None,
        }
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plan.description = description.into();
        self
    }

    /// Set the apparatus identifier.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.plan.driver = driver.into();
        self
    }

    /// Declare the signal used by subsequent `segment` and `position_trigger` calls.
    pub fn signal(mut self, signal: impl Into<String>) -> Self {
        self.last_signal = Some(signal.into());
        self
    }

    fn current_signal(&mut self, what: &str) -> String {
        match &self.last_signal {
            Some(signal) => signal.clone(),
            None => {
                self.error
                    .get_or_insert_with(|| format!("No signal declared before {}", what));
                String::new()
            }
        }
    }

    /// Add a segment on the last declared signal.
    pub fn segment(mut self, name: impl Into<String>, limit: LimitCondition) -> Self {
        let signal = self.current_signal("segment");
        self.plan.segments.push(Segment::new(name, signal, limit));
        self
    }

    /// Add a segment on an explicit signal.
    pub fn segment_on(
        mut self,
        name: impl Into<String>,
        signal: impl Into<String>,
        limit: LimitCondition,
    ) -> Self {
        self.plan.segments.push(Segment::new(name, signal, limit));
        self
    }

    /// Add a segment lasting `duration` of running time.
    pub fn timed_segment(mut self, name: impl Into<String>, duration: Duration) -> Self {
        self.plan.segments.push(Segment::timed(name, duration));
        self
    }

    /// Add a fully specified segment.
    pub fn push_segment(mut self, segment: Segment) -> Self {
        self.plan.segments.push(segment);
        self
    }

    /// Enable `trigger` on the most recently added segment.
    pub fn enable(mut self, trigger: impl Into<String>) -> Self {
        match self.plan.segments.last_mut() {
            Some(segment) => segment.triggers.push(trigger.into()),
            None => {
                self.error
                    .get_or_insert_with(|| "No segment to enable a trigger on".to_string());
            }
        }
        self
    }

    /// Add an abort condition.
    pub fn abort_condition(
        mut self,
        name: impl Into<String>,
        signal: impl Into<String>,
        limit: LimitCondition,
    ) -> Self {
        self.plan
            .abort_conditions
            .push(AbortCondition::new(name, signal, limit));
        self
    }

    /// Add a trigger firing every `interval` of change in the last declared signal.
    pub fn position_trigger(mut self, name: impl Into<String>, interval: f64) -> Self {
        let signal = self.current_signal("trigger");
        self.plan.triggers.push(TriggerSpec {
            name: name.into(),
            kind: TriggerKind::Position { signal, interval },
        });
        self
    }

    /// Add a trigger firing once near `target` of the last declared signal.
    pub fn single_fire_trigger(mut self, name: impl Into<String>, target: f64, tolerance: f64) -> Self {
        let signal = self.current_signal("trigger");
        self.plan.triggers.push(TriggerSpec {
            name: name.into(),
            kind: TriggerKind::SingleFire {
                signal,
                target,
                tolerance,
            },
        });
        self
    }

    /// Add a trigger firing every `period` of running time.
    pub fn timed_trigger(mut self, name: impl Into<String>, period: Duration) -> Self {
        self.plan.triggers.push(TriggerSpec {
            name: name.into(),
            kind: TriggerKind::Timed { period },
        });
        self
    }

    /// Finish building.
    ///
    /// Structural mistakes made while building (a segment added before any
    /// signal was declared) are reported here. Signal resolution is checked by
    /// [`ExperimentPlan::validate`] when the plan is loaded.
    pub fn build(self) -> DriverResult<ExperimentPlan> {
        match self.error {
            Some(error) => Err(DriverError::InvalidPlan(error)),
            None => Ok(self.plan),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
