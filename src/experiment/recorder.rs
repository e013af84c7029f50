//! Plan Recorder implementations.
//!
//! The driver reports everything that happens during a run to one
//! [`PlanRecorder`]: run start, every closed segment record, trigger firings,
//! plan completion or abort, and non-fatal warnings. Calls are made from the
//! single task that owns driver state, in the order the events were applied.

use crate::experiment::plan::ExperimentPlan;
use crate::experiment::record::{ExperimentRecord, SegmentRecord, TriggerRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Consumer of plan-run events.
///
/// Implementations must not block: they are called while the driver holds
/// its transition lock.
pub trait PlanRecorder: Send + Sync {
    /// A run of `plan` started.
    fn run_started(&self, run_id: Uuid, plan: &ExperimentPlan);

    /// A segment record was closed.
    fn segment_complete(&self, record: &SegmentRecord);

    /// A trigger fired.
    fn trigger_occurred(&self, record: &TriggerRecord);

    /// Every segment terminated normally.
    fn plan_complete(&self, record: &ExperimentRecord);

    /// The run was aborted; the reason is in `record.outcome`.
    fn plan_aborted(&self, record: &ExperimentRecord);

    /// Something went wrong that does not stop the run.
    fn warning(&self, message: &str);
}

/// Serializable form of every recorder call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    /// Run started
    RunStarted {
        /// Run id
        run_id: Uuid,
        /// Plan name
        plan_name: String,
    },
    /// Segment record closed
    SegmentComplete {
        /// The closed record
        record: SegmentRecord,
    },
    /// Trigger fired
    TriggerOccurred {
        /// The firing
        record: TriggerRecord,
    },
    /// Plan completed
    PlanComplete {
        /// Full run record
        record: ExperimentRecord,
    },
    /// Plan aborted
    PlanAborted {
        /// Full run record
        record: ExperimentRecord,
    },
    /// Non-fatal problem
    Warning {
        /// Description
        message: String,
    },
}

/// Recorder that only logs.
///
/// Used by the driver when no other recorder is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl PlanRecorder for TracingRecorder {
    fn run_started(&self, run_id: Uuid, plan: &ExperimentPlan) {
        info!(%run_id, plan = %plan.name, segments = plan.segments.len(), "Run started");
    }

    fn segment_complete(&self, record: &SegmentRecord) {
        info!(
            segment = %record.segment_name,
            signal = %record.signal_name,
            termination = record.termination_signal,
            "Segment complete"
        );
    }

    fn trigger_occurred(&self, record: &TriggerRecord) {
        info!(
            trigger = %record.trigger_name,
            segment = %record.segment_name,
            signal = record.triggering_signal,
            "Trigger occurred"
        );
    }

    fn plan_complete(&self, record: &ExperimentRecord) {
        info!(run_id = %record.run_id, plan = %record.plan_name, "Plan complete");
    }

    fn plan_aborted(&self, record: &ExperimentRecord) {
        warn!(run_id = %record.run_id, plan = %record.plan_name, outcome = ?record.outcome, "Plan aborted");
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }
}

/// Recorder keeping every event in memory.
///
/// Clones share the same event log.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<PlanEvent>>>,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, in arrival order.
    pub fn events(&self) -> Vec<PlanEvent> {
        self.events.lock().clone()
    }

    /// Closed segment records, in arrival order.
    pub fn segments(&self) -> Vec<SegmentRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlanEvent::SegmentComplete { record } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Trigger firings, in arrival order.
    pub fn triggers(&self) -> Vec<TriggerRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlanEvent::TriggerOccurred { record } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Warning messages, in arrival order.
    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlanEvent::Warning { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Finished runs (completed or aborted), in finishing order.
    pub fn finished_runs(&self) -> Vec<ExperimentRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlanEvent::PlanComplete { record } | PlanEvent::PlanAborted { record } => {
                    Some(record.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: PlanEvent) {
        self.events.lock().push(event);
    }
}

impl PlanRecorder for MemoryRecorder {
    fn run_started(&self, run_id: Uuid, plan: &ExperimentPlan) {
        self.push(PlanEvent::RunStarted {
            run_id,
            plan_name: plan.name.clone(),
        });
    }

    fn segment_complete(&self, record: &SegmentRecord) {
        self.push(PlanEvent::SegmentComplete {
            record: record.clone(),
        });
    }

    fn trigger_occurred(&self, record: &TriggerRecord) {
        self.push(PlanEvent::TriggerOccurred {
            record: record.clone(),
        });
    }

    fn plan_complete(&self, record: &ExperimentRecord) {
        self.push(PlanEvent::PlanComplete {
            record: record.clone(),
        });
    }

    fn plan_aborted(&self, record: &ExperimentRecord) {
        self.push(PlanEvent::PlanAborted {
            record: record.clone(),
        });
    }

    fn warning(&self, message: &str) {
        self.push(PlanEvent::Warning {
            message: message.to_string(),
        });
    }
}

/// Recorder publishing every event on a broadcast channel.
///
/// Remote observers (a GUI, a network bridge) subscribe and forward the
/// serialized [`PlanEvent`]s. Slow subscribers lag and lose the oldest events;
/// the driver is never blocked by them.
#[derive(Debug, Clone)]
pub struct BroadcastRecorder {
    tx: broadcast::Sender<PlanEvent>,
}

impl BroadcastRecorder {
    /// Create a recorder buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: PlanEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

impl PlanRecorder for BroadcastRecorder {
    fn run_started(&self, run_id: Uuid, plan: &ExperimentPlan) {
        self.publish(PlanEvent::RunStarted {
            run_id,
            plan_name: plan.name.clone(),
        });
    }

    fn segment_complete(&self, record: &SegmentRecord) {
        self.publish(PlanEvent::SegmentComplete {
            record: record.clone(),
        });
    }

    fn trigger_occurred(&self, record: &TriggerRecord) {
        self.publish(PlanEvent::TriggerOccurred {
            record: record.clone(),
        });
    }

    fn plan_complete(&self, record: &ExperimentRecord) {
        self.publish(PlanEvent::PlanComplete {
            record: record.clone(),
        });
    }

    fn plan_aborted(&self, record: &ExperimentRecord) {
        self.publish(PlanEvent::PlanAborted {
            record: record.clone(),
        });
    }

    fn warning(&self, message: &str) {
        self.publish(PlanEvent::Warning {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::record::{OpenSegmentRecord, RunOutcome};

    #[test]
    fn memory_recorder_keeps_order() {
        let recorder = MemoryRecorder::new();
        let plan = ExperimentPlan {
            name: "p".into(),
            ..Default::default()
        };
        let mut run = ExperimentRecord::begin("p");

        recorder.run_started(run.run_id, &plan);
        let first = OpenSegmentRecord::open("a", "T").close(1.0);
        let second = OpenSegmentRecord::open("b", "T").close(2.0);
        recorder.segment_complete(&first);
        recorder.warning("T unavailable");
        recorder.segment_complete(&second);
        run.finish(RunOutcome::Completed);
        recorder.plan_complete(&run);

        let names: Vec<_> = recorder
            .segments()
            .into_iter()
            .map(|s| s.segment_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(recorder.warnings(), vec!["T unavailable".to_string()]);
        assert_eq!(recorder.finished_runs().len(), 1);
        assert!(matches!(recorder.events()[0], PlanEvent::RunStarted { .. }));

        recorder.clear();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn broadcast_recorder_publishes_events() {
        let recorder = BroadcastRecorder::new(16);
        let mut rx = recorder.subscribe();

        recorder.warning("careful");
        let record = OpenSegmentRecord::open("a", "T").close(5.0);
        recorder.segment_complete(&record);

        assert_eq!(
            rx.recv().await.unwrap(),
            PlanEvent::Warning {
                message: "careful".into()
            }
        );
        match rx.recv().await.unwrap() {
            PlanEvent::SegmentComplete { record } => assert_eq!(record.termination_signal, 5.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn plan_event_serializes_with_tag() {
        let event = PlanEvent::Warning {
            message: "x".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "warning");
    }

    #[test]
    fn segment_event_with_unreadable_signal_decodes() {
        let event = PlanEvent::SegmentComplete {
            record: OpenSegmentRecord::open("ramp", "T").close(f64::NAN),
        };
        let json = serde_json::to_string(&event).unwrap();

        match serde_json::from_str::<PlanEvent>(&json).unwrap() {
            PlanEvent::SegmentComplete { record } => {
                assert_eq!(record.segment_name, "ramp");
                assert!(record.termination_signal.is_nan());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
