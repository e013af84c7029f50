//! End-to-end plan execution: segment termination, abort conditions,
//! pause/resume and triggers.

mod common;

use common::{engine, eventually, heat_plan, registry, rig, settle, two_segment_plan};
use experiment_driver::experiment::{
    AbortReason, BroadcastRecorder, DriverState, ExperimentDriver, ExperimentPlan, LimitCondition,
    MemoryRecorder, Operation, PlanEvent, RunOutcome,
};
use experiment_driver::hardware::{MockApparatus, MockTriggerable};
use experiment_driver::signal::{ObservableSignal, SequenceSignal, SignalRegistry};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn segment_terminates_on_first_satisfying_value() {
    let apparatus = MockApparatus::new("furnace");
    let recorder = MemoryRecorder::new();
    let signals = SignalRegistry::new().with(Arc::new(SequenceSignal::new("T", vec![10.0, 50.0, 100.0])));
    let driver = ExperimentDriver::builder(apparatus.clone(), signals)
        .recorder(recorder.clone())
        .engine(engine())
        .build();

    let plan = ExperimentPlan::builder("ramp")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(100.0))
        .build()
        .unwrap();
    driver.load_plan(plan).await.unwrap();
    driver.start().await.unwrap();
    settle(&driver).await;

    let segments = recorder.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].segment_name, "ramp");
    assert_eq!(segments[0].signal_name, "T");
    assert_eq!(segments[0].termination_signal, 100.0);
    assert!(segments[0].end_time >= segments[0].start_time);

    let record = driver.last_record().await.unwrap();
    assert_eq!(record.outcome, RunOutcome::Completed);
    assert!(record.ended.is_some());
    assert_eq!(recorder.finished_runs().len(), 1);
}

#[tokio::test]
async fn abort_condition_force_closes_open_segment() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.temperature.set(40.0);

    rig.pressure.set(-1.0);
    settle(&rig.driver).await;

    let segments = rig.recorder.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].segment_name, "ramp");
    assert_eq!(segments[0].termination_signal, -1.0);

    let record = rig.driver.last_record().await.unwrap();
    assert_eq!(
        record.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::Condition {
                name: "vacuum".into(),
                value: -1.0
            }
        }
    );
    assert!(rig.driver.active_conditions().await.is_empty());
    assert!(rig.driver.open_segment().await.is_none());
    assert_eq!(rig.apparatus.calls(), vec![Operation::Start, Operation::Abort]);
    assert!(matches!(
        rig.recorder.events().last(),
        Some(PlanEvent::PlanAborted { .. })
    ));
}

#[tokio::test]
async fn segments_run_in_order_then_driver_idles() {
    let rig = rig(two_segment_plan()).await;
    rig.driver.start().await.unwrap();

    rig.temperature.set(55.0);
    eventually(|| rig.recorder.segments().len() == 1).await;
    assert_eq!(rig.driver.state(), DriverState::Running);
    assert_eq!(rig.driver.open_segment().await.unwrap().segment_name(), "anneal");

    rig.temperature.set(101.0);
    settle(&rig.driver).await;

    let names: Vec<_> = rig
        .recorder
        .segments()
        .into_iter()
        .map(|s| (s.segment_name, s.termination_signal))
        .collect();
    assert_eq!(names, vec![("ramp".to_string(), 55.0), ("anneal".to_string(), 101.0)]);
    assert!(rig.driver.active_conditions().await.is_empty());
    // Stopping the apparatus at the end goes through the abort hook
    assert_eq!(rig.apparatus.calls(), vec![Operation::Start, Operation::Abort]);
    assert_eq!(rig.driver.last_record().await.unwrap().outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn completion_survives_failing_abort_hook() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.apparatus.fail_on(Operation::Abort);

    rig.temperature.set(100.0);
    settle(&rig.driver).await;

    assert_eq!(rig.driver.last_record().await.unwrap().outcome, RunOutcome::Completed);
    assert_eq!(rig.recorder.warnings().len(), 1);
    assert!(rig.driver.active_conditions().await.is_empty());
}

#[tokio::test]
async fn condition_with_failing_abort_hook_keeps_running() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.apparatus.fail_on(Operation::Abort);

    rig.pressure.set(-1.0);
    eventually(|| !rig.recorder.warnings().is_empty()).await;
    assert_eq!(rig.driver.state(), DriverState::Running);
    assert!(rig.driver.open_segment().await.is_some());

    // Retry from the control surface once the apparatus recovers
    rig.apparatus.recover(Operation::Abort);
    rig.driver.abort().await.unwrap();
    assert_eq!(rig.driver.state(), DriverState::Idle);
    assert_eq!(
        rig.driver.last_record().await.unwrap().outcome,
        RunOutcome::Aborted {
            reason: AbortReason::User
        }
    );
}

#[tokio::test]
async fn pause_then_resume_completes_like_uninterrupted_run() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.temperature.set(60.0);

    rig.driver.pause().await.unwrap();
    rig.driver.resume().await.unwrap();
    assert_eq!(rig.driver.open_segment().await.unwrap().segment_name(), "ramp");

    rig.temperature.set(100.0);
    settle(&rig.driver).await;

    let segments = rig.recorder.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].termination_signal, 100.0);
    assert_eq!(
        rig.apparatus.calls(),
        vec![Operation::Start, Operation::Pause, Operation::Resume, Operation::Abort]
    );
}

#[tokio::test]
async fn change_during_pause_is_evaluated_on_resume() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.driver.pause().await.unwrap();

    rig.temperature.set(150.0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(rig.driver.state(), DriverState::Paused);
    assert!(rig.recorder.segments().is_empty());

    rig.driver.resume().await.unwrap();
    settle(&rig.driver).await;
    assert_eq!(rig.recorder.segments()[0].termination_signal, 150.0);
}

#[tokio::test]
async fn abort_condition_fires_while_paused() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.driver.pause().await.unwrap();
    assert_eq!(rig.driver.active_conditions().await, vec!["vacuum".to_string()]);

    rig.pressure.set(-2.0);
    settle(&rig.driver).await;

    let record = rig.driver.last_record().await.unwrap();
    assert!(matches!(
        record.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::Condition { .. }
        }
    ));
    assert_eq!(record.segments.len(), 1);
    assert_eq!(record.segments[0].termination_signal, -2.0);
}

#[tokio::test]
async fn user_abort_closes_segment_with_current_value() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.temperature.set(42.5);

    rig.driver.abort().await.unwrap();
    // Everything is done by the time abort() returns
    assert_eq!(rig.driver.state(), DriverState::Idle);
    let segments = rig.recorder.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].termination_signal, 42.5);
    assert_eq!(rig.recorder.finished_runs().len(), 1);
}

#[tokio::test]
async fn user_abort_with_unavailable_signal_records_nan() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.temperature.set_unavailable();

    rig.driver.abort().await.unwrap();
    let segments = rig.recorder.segments();
    assert_eq!(segments.len(), 1);
    assert!(segments[0].termination_signal.is_nan());
}

#[tokio::test]
async fn unavailable_segment_signal_stalls_with_warning() {
    let rig = rig(heat_plan()).await;
    rig.temperature.set_unavailable();
    rig.driver.start().await.unwrap();

    eventually(|| !rig.recorder.warnings().is_empty()).await;
    assert_eq!(rig.driver.state(), DriverState::Running);

    rig.temperature.set(100.0);
    settle(&rig.driver).await;
    assert_eq!(rig.recorder.warnings().len(), 1);
    assert_eq!(rig.recorder.segments()[0].termination_signal, 100.0);
}

#[tokio::test]
async fn driver_restarts_after_abort() {
    let rig = rig(heat_plan()).await;
    rig.driver.start().await.unwrap();
    rig.driver.abort().await.unwrap();

    rig.driver.start().await.unwrap();
    assert_eq!(rig.driver.state(), DriverState::Running);
    assert_eq!(rig.driver.open_segment().await.unwrap().segment_name(), "ramp");

    rig.temperature.set(100.0);
    settle(&rig.driver).await;

    let runs = rig.recorder.finished_runs();
    assert_eq!(runs.len(), 2);
    assert_ne!(runs[0].run_id, runs[1].run_id);
    assert_eq!(runs[1].outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn timed_segment_follows_signal_segment() {
    let temperature = ObservableSignal::new("T", 0.0);
    let pressure = ObservableSignal::new("P", 1.0);
    let recorder = MemoryRecorder::new();
    let driver = ExperimentDriver::builder(MockApparatus::new("furnace"), registry(&temperature, &pressure))
        .recorder(recorder.clone())
        .engine(engine())
        .build();

    let plan = ExperimentPlan::builder("heat and hold")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(100.0))
        .timed_segment("hold", Duration::from_millis(40))
        .build()
        .unwrap();
    driver.load_plan(plan).await.unwrap();
    driver.start().await.unwrap();

    temperature.set(100.0);
    settle(&driver).await;

    let segments = recorder.segments();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[1].segment_name, "hold");
    assert!(segments[1].termination_signal >= 0.04);
    assert!(segments[1].duration() >= chrono::Duration::milliseconds(40));
}

#[tokio::test]
async fn position_trigger_runs_action_within_its_segment() {
    let temperature = ObservableSignal::new("T", 0.0);
    let pressure = ObservableSignal::new("P", 1.0);
    let recorder = MemoryRecorder::new();
    let snapshot = MockTriggerable::new();
    let driver = ExperimentDriver::builder(MockApparatus::new("furnace"), registry(&temperature, &pressure))
        .recorder(recorder.clone())
        .engine(engine())
        .trigger_action("snapshot", snapshot.clone())
        .build();

    let plan = ExperimentPlan::builder("stepped ramp")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(100.0))
        .enable("snapshot")
        .position_trigger("snapshot", 20.0)
        .build()
        .unwrap();
    driver.load_plan(plan).await.unwrap();
    driver.start().await.unwrap();

    for value in [10.0, 20.0, 30.0, 45.0] {
        temperature.set(value);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    eventually(|| snapshot.count() == 2).await;
    assert_eq!(snapshot.signals(), vec![20.0, 45.0]);

    temperature.set(100.0);
    settle(&driver).await;

    let triggers = recorder.triggers();
    assert!(triggers.len() >= 2);
    assert!(triggers.iter().all(|t| t.trigger_name == "snapshot" && t.segment_name == "ramp"));
    assert_eq!(triggers[0].triggering_signal, 20.0);
}

#[tokio::test]
async fn broadcast_recorder_streams_run_events() {
    let temperature = ObservableSignal::new("T", 0.0);
    let pressure = ObservableSignal::new("P", 1.0);
    let recorder = BroadcastRecorder::new(64);
    let mut events = recorder.subscribe();
    let driver = ExperimentDriver::builder(MockApparatus::new("furnace"), registry(&temperature, &pressure))
        .recorder(recorder)
        .engine(engine())
        .build();
    driver.load_plan(heat_plan()).await.unwrap();

    driver.start().await.unwrap();
    temperature.set(100.0);
    settle(&driver).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(PlanEvent::RunStarted { plan_name, .. }) if plan_name == "heat"));
    assert!(matches!(received.get(1), Some(PlanEvent::SegmentComplete { .. })));
    assert!(matches!(received.last(), Some(PlanEvent::PlanComplete { .. })));
}
