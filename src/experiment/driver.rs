//! Driver State Machine
//!
//! [`ExperimentDriver`] is the control surface of a plan run: `zero`, `start`,
//! `pause`, `resume` and `abort`, gated by the IDLE / RUNNING / PAUSED state
//! machine in [`state`](super::state).
//!
//! # Concurrency
//!
//! One async mutex guards the only mutable shared state: the driver state,
//! the active run and its open segment record. Every public operation holds
//! it for its whole duration, apparatus hook included, so transitions never
//! overlap. A caller that loses a race waits for the winner to finish, then
//! re-checks its precondition and fails with `InvalidTransition` if it no
//! longer holds.
//!
//! Monitoring tasks (segment watcher, abort conditions, triggers) never touch
//! driver state. They send [`RunEvent`]s on the run's channel; a supervisor
//! task applies them one by one under the same mutex. Events from a run that
//! has already ended are dropped, so several abort conditions firing at once
//! cause exactly one abort.
//!
//! ```text
//! control surface ──► zero/start/pause/resume/abort ──┐
//!                                                     ├──► Mutex<DriverCore> ──► Apparatus hooks
//! monitor tasks ──► mpsc<RunEvent> ──► supervisor ────┘          │
//!                                                                └──► PlanRecorder
//! ```

use crate::config::{DriverConfig, EngineConfig};
use crate::error::{DriverError, DriverResult};
use crate::experiment::abort::AbortMonitors;
use crate::experiment::event::{PauseGate, RunEvent};
use crate::experiment::executor::{ActiveSegment, RunContext};
use crate::experiment::plan::ExperimentPlan;
use crate::experiment::record::{
    AbortReason, ExperimentRecord, OpenSegmentRecord, RunOutcome, SegmentRecord, TriggerRecord,
};
use crate::experiment::recorder::{PlanRecorder, TracingRecorder};
use crate::experiment::state::{DriverState, Operation};
use crate::hardware::{Apparatus, Triggerable};
use crate::signal::SignalRegistry;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Who is tearing a run down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    /// A public operation
    ControlSurface,
    /// The run's own supervisor task
    Supervisor,
}

/// Whether the supervisor keeps consuming events after applying one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// Everything that exists only while a plan runs.
struct ActiveRun {
    context: RunContext,
    record: ExperimentRecord,
    monitors: AbortMonitors,
    segment: Option<ActiveSegment>,
    paused_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn pause(&self) {
        self.paused_tx.send_replace(true);
        if let Some(segment) = &self.segment {
            segment.pause();
        }
    }

    fn resume(&self) {
        if let Some(segment) = &self.segment {
            segment.resume();
        }
        self.paused_tx.send_replace(false);
    }

    /// Stop every task of the run and close the open segment record.
    ///
    /// `termination` is the value to close the record with; `None` reads the
    /// segment's signal now.
    async fn teardown(
        &mut self,
        termination: Option<f64>,
        caller: Caller,
    ) -> Option<SegmentRecord> {
        self.monitors.deactivate().await;

        let closed = match self.segment.take() {
            Some(segment) => {
                let value = match termination {
                    Some(value) => value,
                    None => segment.read_signal().await,
                };
                Some(segment.close(value).await)
            }
            None => None,
        };

        if let Some(supervisor) = self.supervisor.take() {
            // The supervisor cannot cancel itself mid-teardown
            if caller == Caller::ControlSurface {
                supervisor.abort();
            }
        }
        closed
    }

    /// Stop every task without waiting.
    fn abort_tasks(&mut self) {
        self.monitors.abort_all();
        if let Some(segment) = &self.segment {
            segment.abort_tasks();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

#[derive(Default)]
struct DriverCore {
    state: DriverState,
    plan: Option<Arc<ExperimentPlan>>,
    run: Option<ActiveRun>,
    last_record: Option<ExperimentRecord>,
}

impl Drop for DriverCore {
    fn drop(&mut self) {
        // Runs when the last handle to the driver internals goes away
        if let Some(run) = self.run.as_mut() {
            run.abort_tasks();
        }
    }
}

struct DriverInner {
    apparatus: Arc<dyn Apparatus>,
    signals: SignalRegistry,
    recorder: Arc<dyn PlanRecorder>,
    actions: HashMap<String, Arc<dyn Triggerable>>,
    engine: EngineConfig,
    core: Mutex<DriverCore>,
    state_tx: watch::Sender<DriverState>,
}

/// Builder for [`ExperimentDriver`].
pub struct DriverBuilder {
    apparatus: Arc<dyn Apparatus>,
    signals: SignalRegistry,
    recorder: Arc<dyn PlanRecorder>,
    actions: HashMap<String, Arc<dyn Triggerable>>,
    engine: EngineConfig,
}

impl DriverBuilder {
    /// Report run events to `recorder` (default: log them).
    pub fn recorder<R: PlanRecorder + 'static>(mut self, recorder: R) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Report run events to a shared recorder.
    pub fn shared_recorder(mut self, recorder: Arc<dyn PlanRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Take engine settings from a loaded configuration.
    pub fn config(mut self, config: &DriverConfig) -> Self {
        self.engine = config.engine.clone();
        self
    }

    /// Set engine settings directly.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Run `action` every time the trigger called `trigger` fires.
    pub fn trigger_action<T: Triggerable + 'static>(mut self, trigger: impl Into<String>, action: T) -> Self {
        self.actions.insert(trigger.into(), Arc::new(action));
        self
    }

    /// Finish building. The driver starts IDLE with no plan loaded.
    pub fn build(self) -> ExperimentDriver {
        let (state_tx, _) = watch::channel(DriverState::Idle);
        ExperimentDriver {
            inner: Arc::new(DriverInner {
                apparatus: self.apparatus,
                signals: self.signals,
                recorder: self.recorder,
                actions: self.actions,
                engine: self.engine,
                core: Mutex::new(DriverCore::default()),
                state_tx,
            }),
        }
    }
}

/// Executes experiment plans against one apparatus.
///
/// # Example
///
/// ```rust,ignore
/// let driver = ExperimentDriver::builder(rig.clone(), signals)
///     .recorder(recorder.clone())
///     .build();
///
/// driver.load_plan(plan).await?;
/// driver.zero().await?;
/// driver.start().await?;
/// driver.wait_for_idle().await;
/// println!("{}", driver.last_record().await.unwrap().summary());
/// ```
pub struct ExperimentDriver {
    inner: Arc<DriverInner>,
}

impl ExperimentDriver {
    /// Start building a driver for `apparatus`, resolving signals in `signals`.
    pub fn builder<A: Apparatus + 'static>(apparatus: A, signals: SignalRegistry) -> DriverBuilder {
        DriverBuilder {
            apparatus: Arc::new(apparatus),
            signals,
            recorder: Arc::new(TracingRecorder),
            actions: HashMap::new(),
            engine: EngineConfig::default(),
        }
    }

    /// Driver with default settings and a logging recorder.
    pub fn new<A: Apparatus + 'static>(apparatus: A, signals: SignalRegistry) -> Self {
        Self::builder(apparatus, signals).build()
    }

    /// Validate `plan` and make it the plan the next `start()` runs.
    ///
    /// # Errors
    ///
    /// `InvalidPlan` if the plan does not validate against the driver's
    /// signals, or if a run is in progress.
    #[instrument(skip(self, plan), fields(plan = %plan.name), err)]
    pub async fn load_plan(&self, plan: ExperimentPlan) -> DriverResult<()> {
        let mut core = self.inner.core.lock().await;
        if core.state != DriverState::Idle {
            return Err(DriverError::InvalidPlan(format!(
                "Cannot load a plan while the driver is {}",
                core.state
            )));
        }

        plan.validate(&self.inner.signals)?;
        if !plan.driver.is_empty() && plan.driver != self.inner.apparatus.name() {
            warn!(
                plan_driver = %plan.driver,
                apparatus = %self.inner.apparatus.name(),
                "Plan was written for a different apparatus"
            );
        }

        info!(segments = plan.segments.len(), abort_conditions = plan.abort_conditions.len(), "Plan loaded");
        core.plan = Some(Arc::new(plan));
        Ok(())
    }

    /// Reset the apparatus. IDLE → IDLE.
    #[instrument(skip(self), err)]
    pub async fn zero(&self) -> DriverResult<()> {
        let core = self.inner.core.lock().await;
        self.inner.check(&core, Operation::Zero)?;
        self.inner.call_hook(Operation::Zero).await?;
        info!(apparatus = %self.inner.apparatus.name(), "Apparatus zeroed");
        Ok(())
    }

    /// Run the loaded plan. IDLE → RUNNING.
    ///
    /// Activates every abort condition, calls the start hook, then opens the
    /// first segment. If the hook fails the abort conditions are deactivated
    /// again and the driver stays IDLE.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if not IDLE
    /// - `NoPlanLoaded` if no plan was loaded
    /// - `HookFailure` if the start hook fails
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> DriverResult<()> {
        let mut core = self.inner.core.lock().await;
        self.inner.check(&core, Operation::Start)?;
        let plan = core.plan.clone().ok_or(DriverError::NoPlanLoaded)?;

        let poll_interval = self.inner.engine.poll_interval();
        let (events_tx, events_rx) = mpsc::channel(self.inner.engine.event_channel_capacity.max(1));
        let (paused_tx, paused_rx) = watch::channel(false);

        let context = RunContext::resolve(
            Arc::clone(&plan),
            &self.inner.signals,
            &self.inner.actions,
            poll_interval,
            events_tx.clone(),
            PauseGate::new(paused_rx),
        )?;
        let mut monitors =
            AbortMonitors::activate(&plan.abort_conditions, &self.inner.signals, poll_interval, &events_tx)
                .await?;
        drop(events_tx);

        if let Err(e) = self.inner.call_hook(Operation::Start).await {
            monitors.deactivate().await;
            return Err(e);
        }

        let record = ExperimentRecord::begin(&plan.name);
        let run_id = record.run_id;
        self.inner.recorder.run_started(run_id, &plan);

        let Some(first) = context.open(0, false) else {
            // Unreachable: RunContext::resolve rejects plans without segments
            monitors.deactivate().await;
            return Err(DriverError::InvalidPlan("No segments defined!".to_string()));
        };

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&self.inner), run_id, events_rx));
        core.run = Some(ActiveRun {
            context,
            record,
            monitors,
            segment: Some(first),
            paused_tx,
            supervisor: Some(supervisor),
        });
        self.inner.set_state(&mut core, DriverState::Running);
        info!(%run_id, plan = %plan.name, "Plan started");
        Ok(())
    }

    /// Hold the run. RUNNING → PAUSED.
    ///
    /// Segment termination, the segment clock and triggers are suspended;
    /// abort conditions stay active.
    #[instrument(skip(self), err)]
    pub async fn pause(&self) -> DriverResult<()> {
        let mut core = self.inner.core.lock().await;
        self.inner.check(&core, Operation::Pause)?;
        self.inner.call_hook(Operation::Pause).await?;

        if let Some(run) = &core.run {
            run.pause();
        }
        self.inner.set_state(&mut core, DriverState::Paused);
        Ok(())
    }

    /// Continue the run where it left off. PAUSED → RUNNING.
    ///
    /// The open segment is not restarted; its signal is re-read straight away
    /// so a change made during the pause is evaluated.
    #[instrument(skip(self), err)]
    pub async fn resume(&self) -> DriverResult<()> {
        let mut core = self.inner.core.lock().await;
        self.inner.check(&core, Operation::Resume)?;
        self.inner.call_hook(Operation::Resume).await?;

        if let Some(run) = &core.run {
            run.resume();
        }
        self.inner.set_state(&mut core, DriverState::Running);
        Ok(())
    }

    /// Stop the run. RUNNING or PAUSED → IDLE.
    ///
    /// Calls the abort hook, deactivates every abort condition, stops all
    /// monitoring tasks and force-closes the open segment record with the
    /// segment signal's current value (NaN if it cannot be read). All of this
    /// is finished when the call returns. If the hook fails nothing changes.
    #[instrument(skip(self), err)]
    pub async fn abort(&self) -> DriverResult<()> {
        let mut core = self.inner.core.lock().await;
        self.inner.check(&core, Operation::Abort)?;
        self.inner
            .abort_run(&mut core, AbortReason::User, Caller::ControlSurface)
            .await
    }

    /// Current state.
    pub fn state(&self) -> DriverState {
        *self.inner.state_tx.borrow()
    }

    /// Follow state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the driver is IDLE (returns at once if it already is).
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|state| *state == DriverState::Idle).await;
    }

    /// Snapshot of the open segment record, if a segment is running.
    pub async fn open_segment(&self) -> Option<OpenSegmentRecord> {
        let core = self.inner.core.lock().await;
        core.run
            .as_ref()
            .and_then(|run| run.segment.as_ref())
            .map(|segment| segment.record.clone())
    }

    /// Names of the active abort conditions.
    pub async fn active_conditions(&self) -> Vec<String> {
        let core = self.inner.core.lock().await;
        core.run
            .as_ref()
            .map(|run| run.monitors.names())
            .unwrap_or_default()
    }

    /// Record of the run in progress, if any.
    pub async fn current_record(&self) -> Option<ExperimentRecord> {
        let core = self.inner.core.lock().await;
        core.run.as_ref().map(|run| run.record.clone())
    }

    /// Record of the most recently finished run.
    pub async fn last_record(&self) -> Option<ExperimentRecord> {
        self.inner.core.lock().await.last_record.clone()
    }

    /// Name of the loaded plan.
    pub async fn plan_name(&self) -> Option<String> {
        let core = self.inner.core.lock().await;
        core.plan.as_ref().map(|plan| plan.name.clone())
    }
}

impl DriverInner {
    /// Check `operation` is allowed now.
    fn check(&self, core: &DriverCore, operation: Operation) -> DriverResult<DriverState> {
        core.state.apply(operation).map_err(|e| {
            warn!(%operation, state = %core.state, "Rejected transition");
            e
        })
    }

    fn set_state(&self, core: &mut DriverCore, state: DriverState) {
        let previous = std::mem::replace(&mut core.state, state);
        if previous != state {
            info!(from = %previous, to = %state, "Driver state changed");
        }
        self.state_tx.send_replace(state);
    }

    async fn call_hook(&self, operation: Operation) -> DriverResult<()> {
        let apparatus = &self.apparatus;
        let result = match operation {
            Operation::Zero => apparatus.do_zero().await,
            Operation::Start => apparatus.do_start().await,
            Operation::Pause => apparatus.do_pause().await,
            Operation::Resume => apparatus.do_resume().await,
            Operation::Abort => apparatus.do_abort().await,
        };
        result.map_err(|source| {
            error!(hook = operation.hook_name(), error = %source, "Apparatus hook failed");
            DriverError::HookFailure {
                hook: operation.hook_name(),
                source,
            }
        })
    }

    /// Abort the active run. The caller has checked the transition.
    async fn abort_run(&self, core: &mut DriverCore, reason: AbortReason, caller: Caller) -> DriverResult<()> {
        self.call_hook(Operation::Abort).await?;

        let termination = match &reason {
            AbortReason::Condition { value, .. } => Some(*value),
            AbortReason::User => None,
        };

        if let Some(mut run) = core.run.take() {
            if let Some(closed) = run.teardown(termination, caller).await {
                run.record.segment_complete(closed.clone());
                self.recorder.segment_complete(&closed);
            }
            info!(run_id = %run.record.run_id, %reason, "Plan aborted");
            run.record.finish(RunOutcome::Aborted { reason });
            self.recorder.plan_aborted(&run.record);
            core.last_record = Some(run.record);
        }

        self.set_state(core, DriverState::Idle);
        Ok(())
    }

    /// Clean up after the last segment terminated.
    ///
    /// Same cleanup as an abort, but a failing abort hook cannot keep the
    /// driver out of IDLE: there is nothing left to run.
    async fn complete_run(&self, core: &mut DriverCore) {
        if let Err(e) = self.call_hook(Operation::Abort).await {
            self.recorder
                .warning(&format!("Stopping the apparatus after plan completion failed: {}", e));
        }

        if let Some(mut run) = core.run.take() {
            run.teardown(None, Caller::Supervisor).await;
            info!(run_id = %run.record.run_id, segments = run.record.segments.len(), "Plan complete");
            run.record.finish(RunOutcome::Completed);
            self.recorder.plan_complete(&run.record);
            core.last_record = Some(run.record);
        }

        self.set_state(core, DriverState::Idle);
    }

    async fn apply(&self, core: &mut DriverCore, event: RunEvent) -> Flow {
        match event {
            RunEvent::SegmentTerminated { index, value } => {
                self.segment_terminated(core, index, value).await
            }
            RunEvent::ConditionFired { condition, value } => {
                if !core.state.can_abort() {
                    return Flow::Finished;
                }
                let reason = AbortReason::Condition {
                    name: condition.clone(),
                    value,
                };
                match self.abort_run(core, reason, Caller::Supervisor).await {
                    Ok(()) => Flow::Finished,
                    Err(e) => {
                        self.recorder.warning(&format!(
                            "Abort condition '{}' fired but the plan could not be stopped: {}",
                            condition, e
                        ));
                        Flow::Continue
                    }
                }
            }
            RunEvent::TriggerFired {
                index,
                trigger,
                value,
            } => {
                let Some(run) = core.run.as_mut() else {
                    return Flow::Finished;
                };
                match &run.segment {
                    Some(segment) if segment.index == index => {
                        let record = TriggerRecord {
                            trigger_name: trigger,
                            segment_name: segment.record.segment_name().to_string(),
                            triggering_signal: value,
                            timestamp: Utc::now(),
                        };
                        run.record.trigger_occurred(record.clone());
                        self.recorder.trigger_occurred(&record);
                    }
                    _ => debug!(%trigger, index, "Dropping trigger from a closed segment"),
                }
                Flow::Continue
            }
            RunEvent::Warning { message } => {
                self.recorder.warning(&message);
                Flow::Continue
            }
        }
    }

    async fn segment_terminated(&self, core: &mut DriverCore, index: usize, value: f64) -> Flow {
        let paused = core.state == DriverState::Paused;
        let Some(run) = core.run.as_mut() else {
            return Flow::Finished;
        };
        let segment = match run.segment.take() {
            Some(segment) if segment.index == index => segment,
            other => {
                debug!(index, "Dropping termination of a closed segment");
                run.segment = other;
                return Flow::Continue;
            }
        };

        let record = segment.close(value).await;
        info!(segment = %record.segment_name, termination = value, "Segment complete");
        run.record.segment_complete(record.clone());
        self.recorder.segment_complete(&record);

        if let Some(next) = run.context.open(index + 1, paused) {
            run.segment = Some(next);
            return Flow::Continue;
        }

        self.complete_run(core).await;
        Flow::Finished
    }
}

/// Apply the run's monitor events until the run ends.
///
/// Holds the driver internals weakly: once the driver is dropped the run's
/// tasks are aborted and the supervisor ends with them.
async fn supervise(inner: Weak<DriverInner>, run_id: Uuid, mut events: mpsc::Receiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            debug!(%run_id, "Driver dropped, supervisor exiting");
            return;
        };
        let mut core = inner.core.lock().await;
        let current = core.run.as_ref().map(|run| run.record.run_id);
        if current != Some(run_id) {
            debug!(%run_id, ?event, "Run already finished, dropping event");
            return;
        }
        if inner.apply(&mut core, event).await == Flow::Finished {
            return;
        }
    }
}
