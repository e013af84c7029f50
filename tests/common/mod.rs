//! Shared fixtures for the driver integration tests.
#![allow(dead_code)]

use experiment_driver::config::EngineConfig;
use experiment_driver::experiment::{ExperimentDriver, ExperimentPlan, LimitCondition, MemoryRecorder};
use experiment_driver::hardware::MockApparatus;
use experiment_driver::signal::{ObservableSignal, SignalRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Generous upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A furnace rig: temperature `T`, chamber pressure `P`.
pub struct Rig {
    pub driver: ExperimentDriver,
    pub apparatus: MockApparatus,
    pub recorder: MemoryRecorder,
    pub temperature: ObservableSignal,
    pub pressure: ObservableSignal,
}

pub fn engine() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 5,
        ..Default::default()
    }
}

pub fn registry(temperature: &ObservableSignal, pressure: &ObservableSignal) -> SignalRegistry {
    SignalRegistry::new()
        .with(Arc::new(temperature.clone()))
        .with(Arc::new(pressure.clone()))
}

/// Rig with `T = 0`, `P = 1` and the given plan loaded.
pub async fn rig(plan: ExperimentPlan) -> Rig {
    rig_with(MockApparatus::new("furnace"), plan).await
}

pub async fn rig_with(apparatus: MockApparatus, plan: ExperimentPlan) -> Rig {
    let temperature = ObservableSignal::new("T", 0.0);
    let pressure = ObservableSignal::new("P", 1.0);
    let recorder = MemoryRecorder::new();

    let driver = ExperimentDriver::builder(apparatus.clone(), registry(&temperature, &pressure))
        .recorder(recorder.clone())
        .engine(engine())
        .build();
    driver.load_plan(plan).await.expect("plan should load");

    Rig {
        driver,
        apparatus,
        recorder,
        temperature,
        pressure,
    }
}

/// One segment `ramp` ending at `T >= 100`, aborted when `P < 0`.
pub fn heat_plan() -> ExperimentPlan {
    ExperimentPlan::builder("heat")
        .driver("furnace")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(100.0))
        .abort_condition("vacuum", "P", LimitCondition::below(0.0))
        .build()
        .expect("valid plan")
}

/// Two segments on `T`: `ramp` to 50, then `anneal` to 100.
pub fn two_segment_plan() -> ExperimentPlan {
    ExperimentPlan::builder("ramp and anneal")
        .driver("furnace")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(50.0))
        .segment("anneal", LimitCondition::at_least(100.0))
        .abort_condition("vacuum", "P", LimitCondition::below(0.0))
        .build()
        .expect("valid plan")
}

/// Wait for the driver to become idle, failing the test after [`TIMEOUT`].
pub async fn settle(driver: &ExperimentDriver) {
    tokio::time::timeout(TIMEOUT, driver.wait_for_idle())
        .await
        .expect("driver did not return to IDLE");
}

/// Poll `condition` until it holds, failing the test after [`TIMEOUT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
