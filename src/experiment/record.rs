//! Bookkeeping produced by a plan run.
//!
//! Every executed segment produces exactly one [`SegmentRecord`]. A record is
//! opened when the segment starts ([`OpenSegmentRecord`]) and closed exactly
//! once; closing consumes the open record, so a closed record can never be
//! reopened or closed twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Termination value used when the signal could not be read at abort time.
pub const UNAVAILABLE_SIGNAL: f64 = f64::NAN;

/// A segment that has started and not yet terminated.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSegmentRecord {
    segment_name: String,
    signal_name: String,
    start_time: DateTime<Utc>,
}

impl OpenSegmentRecord {
    /// Open a record for `segment_name` watching `signal_name`, starting now.
    pub fn open(segment_name: impl Into<String>, signal_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            signal_name: signal_name.into(),
            start_time: Utc::now(),
        }
    }

    /// Name of the running segment.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Name of the watched signal.
    pub fn signal_name(&self) -> &str {
        &self.signal_name
    }

    /// When the segment started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Close the record now with the value that ended the segment.
    pub fn close(self, termination_signal: f64) -> SegmentRecord {
        let end_time = Utc::now().max(self.start_time);
        SegmentRecord {
            segment_name: self.segment_name,
            signal_name: self.signal_name,
            start_time: self.start_time,
            end_time,
            termination_signal,
        }
    }
}

/// When a segment began and ended, and what signal value ended it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Segment name
    pub segment_name: String,
    /// Name of the watched signal
    pub signal_name: String,
    /// Segment start
    pub start_time: DateTime<Utc>,
    /// Segment end
    pub end_time: DateTime<Utc>,
    /// Signal value that terminated the segment (NaN if it could not be read)
    ///
    /// Serialized as `null` when NaN.
    #[serde(with = "nan_as_null")]
    pub termination_signal: f64,
}

impl SegmentRecord {
    /// How long the segment lasted.
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// A trigger firing during a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Trigger name
    pub trigger_name: String,
    /// Segment that was open when it fired
    pub segment_name: String,
    /// Signal value (or elapsed milliseconds for timed triggers) that fired it
    pub triggering_signal: f64,
    /// When it fired
    pub timestamp: DateTime<Utc>,
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortReason {
    /// `abort()` was called by the control surface.
    User,
    /// An abort condition fired.
    Condition {
        /// Name of the condition
        name: String,
        /// Signal value that fired it
        value: f64,
    },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::User => write!(f, "aborted by user"),
            AbortReason::Condition { name, value } => {
                write!(f, "abort condition '{}' fired at {}", name, value)
            }
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Still running.
    InProgress,
    /// Every segment terminated normally.
    Completed,
    /// The run was stopped early.
    Aborted {
        /// What stopped it
        reason: AbortReason,
    },
}

/// Everything recorded during one plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Unique id of the run
    pub run_id: Uuid,
    /// Name of the executed plan
    pub plan_name: String,
    /// Run start
    pub started: DateTime<Utc>,
    /// Run end, once finished
    pub ended: Option<DateTime<Utc>>,
    /// Closed segment records, in execution order
    pub segments: Vec<SegmentRecord>,
    /// Trigger firings, in firing order
    pub triggers: Vec<TriggerRecord>,
    /// How the run ended
    pub outcome: RunOutcome,
}

impl ExperimentRecord {
    /// Begin a record for a new run of `plan_name`.
    pub fn begin(plan_name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            plan_name: plan_name.into(),
            started: Utc::now(),
            ended: None,
            segments: Vec::new(),
            triggers: Vec::new(),
            outcome: RunOutcome::InProgress,
        }
    }

    /// Append a closed segment record.
    pub fn segment_complete(&mut self, record: SegmentRecord) {
        self.segments.push(record);
    }

    /// Append a trigger firing.
    pub fn trigger_occurred(&mut self, record: TriggerRecord) {
        self.triggers.push(record);
    }

    /// Mark the run finished with `outcome`.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.ended = Some(Utc::now());
        self.outcome = outcome;
    }

    /// Whether the run has ended.
    pub fn is_finished(&self) -> bool {
        self.outcome != RunOutcome::InProgress
    }

    /// Human readable report of the run.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Experiment '{}' ({})\n", self.plan_name, self.run_id));

        let outcome = match &self.outcome {
            RunOutcome::InProgress => "in progress".to_string(),
            RunOutcome::Completed => "completed".to_string(),
            RunOutcome::Aborted { reason } => reason.to_string(),
        };
        out.push_str(&format!("Outcome: {}\n", outcome));

        for (index, segment) in self.segments.iter().enumerate() {
            out.push_str(&format!(
                "  [{}] {} ({}): {:.3}s, terminated at {}\n",
                index + 1,
                segment.segment_name,
                segment.signal_name,
                segment.duration().num_milliseconds() as f64 / 1000.0,
                segment.termination_signal
            ));
            for trigger in self
                .triggers
                .iter()
                .filter(|t| t.segment_name == segment.segment_name)
            {
                out.push_str(&format!(
                    "      trigger {} at {}\n",
                    trigger.trigger_name, trigger.triggering_signal
                ));
            }
        }
        out
    }
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
