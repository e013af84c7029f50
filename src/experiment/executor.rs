//! Segment Executor
//!
//! Runs one segment at a time. Opening a segment opens its record, starts the
//! segment clock, spawns a watcher task evaluating the termination predicate
//! and enables the segment's triggers. The watcher reports the first value
//! satisfying the predicate and exits, so each segment reports termination at
//! most once. Closing a segment stops its tasks and closes its record.
//!
//! Sequencing (advance to the next segment, plan completion) is the driver's
//! job; this module only manages the segment that is currently open.

use crate::error::{DriverError, DriverResult};
use crate::experiment::event::{observe_running, PauseGate, RunEvent};
use crate::experiment::plan::{ExperimentPlan, Segment};
use crate::experiment::record::{OpenSegmentRecord, SegmentRecord, UNAVAILABLE_SIGNAL};
use crate::experiment::trigger::TriggerTask;
use crate::hardware::Triggerable;
use crate::signal::{SignalRegistry, SignalSource, SignalWatcher, SEGMENT_TIME_SIGNAL};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Segment clock
// =============================================================================

#[derive(Debug)]
struct ClockState {
    accumulated: Duration,
    running_since: Option<Instant>,
}

/// Pause-aware clock measuring how long a segment has been running.
///
/// Exposed to timed segments and timed triggers as the `segment_time` signal,
/// in seconds.
#[derive(Debug, Clone)]
pub struct SegmentClock {
    state: Arc<Mutex<ClockState>>,
}

impl SegmentClock {
    /// New clock at zero, running unless `paused`.
    pub fn new(paused: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                accumulated: Duration::ZERO,
                running_since: (!paused).then(Instant::now),
            })),
        }
    }

    /// Stop accumulating time.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(since) = state.running_since.take() {
            state.accumulated += since.elapsed();
        }
    }

    /// Accumulate time again.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.running_since.is_none() {
            state.running_since = Some(Instant::now());
        }
    }

    /// Running time so far.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock();
        state.accumulated + state.running_since.map_or(Duration::ZERO, |since| since.elapsed())
    }
}

#[async_trait]
impl SignalSource for SegmentClock {
    fn name(&self) -> &str {
        SEGMENT_TIME_SIGNAL
    }

    async fn read(&self) -> anyhow::Result<f64> {
        Ok(self.elapsed().as_secs_f64())
    }
}

// =============================================================================
// Run context
// =============================================================================

/// Plan with every signal source resolved, ready to run.
///
/// Resolution happens before the run starts so that opening a segment
/// cannot fail halfway through a run.
pub(crate) struct RunContext {
    pub(crate) plan: Arc<ExperimentPlan>,
    segment_sources: Vec<Option<Arc<dyn SignalSource>>>,
    trigger_sources: HashMap<String, Arc<dyn SignalSource>>,
    actions: HashMap<String, Arc<dyn Triggerable>>,
    poll_interval: Duration,
    events: mpsc::Sender<RunEvent>,
    gate: PauseGate,
}

impl RunContext {
    pub(crate) fn resolve(
        plan: Arc<ExperimentPlan>,
        signals: &SignalRegistry,
        actions: &HashMap<String, Arc<dyn Triggerable>>,
        poll_interval: Duration,
        events: mpsc::Sender<RunEvent>,
        gate: PauseGate,
    ) -> DriverResult<Self> {
        if plan.segments.is_empty() {
            return Err(DriverError::InvalidPlan("No segments defined!".to_string()));
        }

        let segment_sources = plan
            .segments
            .iter()
            .map(|segment| {
                if segment.is_timed() {
                    Ok(None)
                } else {
                    signals.resolve(&segment.signal).map(Some)
                }
            })
            .collect::<DriverResult<Vec<_>>>()?;

        let mut trigger_sources = HashMap::new();
        for trigger in &plan.triggers {
            if let Some(signal) = trigger.signal() {
                trigger_sources.insert(trigger.name.clone(), signals.resolve(signal)?);
            }
        }

        Ok(Self {
            plan,
            segment_sources,
            trigger_sources,
            actions: actions.clone(),
            poll_interval,
            events,
            gate,
        })
    }

    /// Open segment `index`: record, clock, watcher and triggers.
    ///
    /// Returns `None` past the last segment.
    pub(crate) fn open(&self, index: usize, paused: bool) -> Option<ActiveSegment> {
        let segment = self.plan.segments.get(index)?;
        let record = OpenSegmentRecord::open(&segment.name, &segment.signal);

        let clock = SegmentClock::new(paused);
        let source: Arc<dyn SignalSource> = match self.segment_sources.get(index) {
            Some(Some(source)) => source.clone(),
            _ => Arc::new(clock.clone()),
        };

        let watcher = SegmentWatcher {
            index,
            segment: segment.clone(),
            watcher: SignalWatcher::new(source.clone(), self.poll_interval),
            gate: self.gate.clone(),
            events: self.events.clone(),
        };
        let mut tasks = vec![tokio::spawn(watcher.run())];

        for name in &segment.triggers {
            let Some(spec) = self.plan.trigger(name) else {
                continue;
            };
            let trigger_source: Arc<dyn SignalSource> = match self.trigger_sources.get(name) {
                Some(source) => source.clone(),
                None => Arc::new(clock.clone()),
            };
            let task = TriggerTask {
                index,
                spec: spec.clone(),
                watcher: SignalWatcher::new(trigger_source, self.poll_interval),
                gate: self.gate.clone(),
                events: self.events.clone(),
                action: self.actions.get(name).cloned(),
            };
            tasks.push(task.spawn());
        }

        info!(
            segment = %segment.name,
            index,
            predicate = %segment.limit.describe(&segment.signal),
            "Segment opened"
        );

        Some(ActiveSegment {
            index,
            record,
            clock,
            source,
            tasks,
        })
    }
}

// =============================================================================
// Active segment
// =============================================================================

/// The segment currently executing.
pub(crate) struct ActiveSegment {
    pub(crate) index: usize,
    pub(crate) record: OpenSegmentRecord,
    clock: SegmentClock,
    source: Arc<dyn SignalSource>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSegment {
    pub(crate) fn pause(&self) {
        self.clock.pause();
    }

    pub(crate) fn resume(&self) {
        self.clock.resume();
    }

    /// Current value of the watched signal, or the unavailable sentinel.
    pub(crate) async fn read_signal(&self) -> f64 {
        match self.source.read().await {
            Ok(value) => value,
            Err(e) => {
                warn!(signal = %self.record.signal_name(), error = %e, "Signal unreadable at segment close");
                UNAVAILABLE_SIGNAL
            }
        }
    }

    /// Stop the watcher and triggers, wait for them, then close the record.
    pub(crate) async fn close(mut self, termination_signal: f64) -> SegmentRecord {
        self.stop().await;
        debug!(segment = %self.record.segment_name(), termination_signal, "Segment closed");
        self.record.close(termination_signal)
    }

    /// Stop the watcher and triggers without waiting.
    pub(crate) fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    async fn stop(&mut self) {
        self.abort_tasks();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

// =============================================================================
// Segment watcher task
// =============================================================================

struct SegmentWatcher {
    index: usize,
    segment: Segment,
    watcher: SignalWatcher,
    gate: PauseGate,
    events: mpsc::Sender<RunEvent>,
}

impl SegmentWatcher {
    async fn run(mut self) {
        let mut unavailable = false;

        loop {
            match observe_running(&mut self.watcher, &mut self.gate).await {
                Ok(value) => {
                    if unavailable {
                        info!(segment = %self.segment.name, "Signal available again");
                        unavailable = false;
                    }
                    if self.segment.limit.is_satisfied(value) {
                        debug!(segment = %self.segment.name, value, "Termination predicate satisfied");
                        let _ = self
                            .events
                            .send(RunEvent::SegmentTerminated {
                                index: self.index,
                                value,
                            })
                            .await;
                        return;
                    }
                }
                Err(e) => {
                    // Stall until the source recovers
                    if !unavailable {
                        unavailable = true;
                        warn!(segment = %self.segment.name, error = %e, "Segment termination stalled");
                        let event = RunEvent::Warning {
                            message: format!("Segment '{}': {}", self.segment.name, e),
                        };
                        if self.events.send(event).await.is_err() {
                            return;
                        }
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
    use crate::signal::{ObservableSignal, SequenceSignal};
    use tokio::sync::watch;

    fn context(
        plan: ExperimentPlan,
        signals: &SignalRegistry,
    ) -> (RunContext, mpsc::Receiver<RunEvent>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (paused_tx, paused_rx) = watch::channel(false);
        let context = RunContext::resolve(
            Arc::new(plan),
            signals,
            &HashMap::new(),
            Duration::from_millis(5),
            tx,
            PauseGate::new(paused_rx),
        )
        .unwrap();
        (context, rx, paused_tx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<RunEvent>) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[test]
    fn clock_stops_while_paused() {
        let clock = SegmentClock::new(true);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.resume();
        std::thread::sleep(Duration::from_millis(20));
        clock.pause();
        let frozen = clock.elapsed();
        assert!(frozen >= Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.elapsed(), frozen);
    }

    #[tokio::test]
    async fn watcher_reports_first_satisfying_value() {
        let signals = SignalRegistry::new().with(Arc::new(SequenceSignal::new(
            "T",
            vec![10.0, 50.0, 100.0, 150.0],
        )));
        let plan = ExperimentPlan::builder("ramp")
            .signal("T")
            .segment("heat", LimitCondition::at_least(100.0))
            .build()
            .unwrap();
        let (context, mut rx, _paused) = context(plan, &signals);

        let segment = context.open(0, false).expect("plan has a first segment");
        assert_eq!(segment.record.segment_name(), "heat");
        assert_eq!(
            next_event(&mut rx).await,
            RunEvent::SegmentTerminated {
                index: 0,
                value: 100.0
            }
        );

        let record = segment.close(100.0).await;
        assert_eq!(record.termination_signal, 100.0);
    }

    #[tokio::test]
    async fn timed_segment_uses_segment_clock() {
        let plan = ExperimentPlan::builder("hold")
            .timed_segment("hold", Duration::from_millis(30))
            .build()
            .unwrap();
        let (context, mut rx, _paused) = context(plan, &SignalRegistry::new());

        let segment = context.open(0, false).expect("plan has a first segment");
        match next_event(&mut rx).await {
            RunEvent::SegmentTerminated { index, value } => {
                assert_eq!(index, 0);
                assert!(value >= 0.03);
            }
            other => panic!("unexpected event {:?}", other),
        }
        segment.close(0.03).await;
    }

    #[tokio::test]
    async fn paused_segment_does_not_terminate() {
        let temperature = ObservableSignal::new("T", 0.0);
        let signals = SignalRegistry::new().with(Arc::new(temperature.clone()));
        let plan = ExperimentPlan::builder("ramp")
            .signal("T")
            .segment("heat", LimitCondition::at_least(100.0))
            .build()
            .unwrap();
        let (context, mut rx, paused) = context(plan, &signals);

        let segment = context.open(0, false).expect("plan has a first segment");
        tokio::time::sleep(Duration::from_millis(20)).await;

        paused.send_replace(true);
        segment.pause();
        temperature.set(120.0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        paused.send_replace(false);
        segment.resume();
        assert_eq!(
            next_event(&mut rx).await,
            RunEvent::SegmentTerminated {
                index: 0,
                value: 120.0
            }
        );
        segment.close(120.0).await;
    }

    #[tokio::test]
    async fn unavailable_signal_stalls_segment() {
        let temperature = ObservableSignal::unavailable("T");
        let signals = SignalRegistry::new().with(Arc::new(temperature.clone()));
        let plan = ExperimentPlan::builder("ramp")
            .signal("T")
            .segment("heat", LimitCondition::at_least(100.0))
            .build()
            .unwrap();
        let (context, mut rx, _paused) = context(plan, &signals);

        let segment = context.open(0, false).expect("plan has a first segment");
        assert!(matches!(next_event(&mut rx).await, RunEvent::Warning { .. }));
        assert!(segment.read_signal().await.is_nan());

        temperature.set(100.0);
        assert!(matches!(
            next_event(&mut rx).await,
            RunEvent::SegmentTerminated { value, .. } if value == 100.0
        ));
        segment.close(100.0).await;
    }
}
