// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Test-only stages, sources and delegates shared by the integration tests.
//!
//! Nothing here runs tasks on its own: the recording delegates keep every
//! task they receive until a test hands it over explicitly, which makes the
//! order of lifecycle events fully deterministic.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use flowcore::{
    ContinuationPolicy, DataSource, EngineError, ExecutablePipeline, ExecutablePipelineStage,
    ExecutableQueryPlan, ExecutableSource, FailSourceTask, HeapBufferProvider, OriginId,
    PipelineExecutionContext, PipelineId, QueryId, QueryLifetimeController, QueryLifetimeListener,
    QueryStatus, QueryStatusListener, QueryTerminationType, Result, SourceEmitFn, SourceEvent,
    SourceStopAttempt, SourceStopOutcome, StartPipelineTask, StopPipelineTask, StopSourceTask,
    TaskOutcome, TupleBuffer, WorkEmitter, WorkTask, WorkerEnvironment, WorkerThreadId,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn test_env() -> WorkerEnvironment {
    WorkerEnvironment::new(
        WorkerThreadId::new(0),
        1,
        Arc::new(HeapBufferProvider::new(64)),
    )
}

pub fn buffer(tuples: u64) -> TupleBuffer {
    TupleBuffer::new(bytes::Bytes::from(vec![0u8; tuples as usize]), tuples)
}

// =============================================================================
// Recording delegates
// =============================================================================

/// Keeps every pipeline task until the test handles it.
#[derive(Default)]
pub struct RecordingEmitter {
    setups: Mutex<Vec<StartPipelineTask>>,
    terminations: Mutex<Vec<StopPipelineTask>>,
    work: Mutex<Vec<WorkTask>>,
    refuse_work: AtomicBool,
}

impl RecordingEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_work(&self) {
        self.refuse_work.store(true, Ordering::SeqCst);
    }

    pub fn setup_count(&self) -> usize {
        self.setups.lock().len()
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.lock().len()
    }

    pub fn work_count(&self) -> usize {
        self.work.lock().len()
    }

    pub fn pending_terminations(&self) -> Vec<PipelineId> {
        self.terminations
            .lock()
            .iter()
            .map(StopPipelineTask::pipeline_id)
            .collect()
    }

    /// Run the setup task of `pipeline_id`, if one is pending.
    pub fn handle_setup(&self, pipeline_id: PipelineId) -> Option<TaskOutcome> {
        let task = {
            let mut setups = self.setups.lock();
            let position = setups.iter().position(|t| t.pipeline_id() == pipeline_id)?;
            setups.remove(position)
        };
        Some(task.execute(&test_env()))
    }

    /// Run every pending setup task, oldest first.
    pub fn handle_all_setups(&self) -> Vec<TaskOutcome> {
        let tasks: Vec<_> = self.setups.lock().drain(..).collect();
        tasks.into_iter().map(|t| t.execute(&test_env())).collect()
    }

    /// Fail the setup task of `pipeline_id` without running it.
    pub fn fail_setup(&self, pipeline_id: PipelineId, error: EngineError) -> bool {
        let task = {
            let mut setups = self.setups.lock();
            let Some(position) = setups.iter().position(|t| t.pipeline_id() == pipeline_id) else {
                return false;
            };
            setups.remove(position)
        };
        task.fail(error);
        true
    }

    pub fn drop_all_setups(&self) -> usize {
        let tasks: Vec<_> = self.setups.lock().drain(..).collect();
        tasks.len()
    }

    pub fn handle_termination(&self, pipeline_id: PipelineId) -> Option<TaskOutcome> {
        let task = {
            let mut terminations = self.terminations.lock();
            let position = terminations
                .iter()
                .position(|t| t.pipeline_id() == pipeline_id)?;
            terminations.remove(position)
        };
        Some(task.execute(&test_env()))
    }

    /// Handle termination tasks until none are left, including the ones the
    /// handled tasks cascade into. Stops early once every remaining task is
    /// only deferring itself. Returns the pipelines stopped, in order.
    pub fn handle_all_terminations(&self) -> Vec<PipelineId> {
        let mut handled = Vec::new();
        let mut deferred = 0;
        loop {
            let next = {
                let mut terminations = self.terminations.lock();
                if terminations.is_empty() || deferred >= terminations.len() {
                    break;
                }
                terminations.remove(0)
            };
            let pipeline_id = next.pipeline_id();
            match next.execute(&test_env()) {
                TaskOutcome::Deferred => deferred += 1,
                _ => {
                    handled.push(pipeline_id);
                    deferred = 0;
                }
            }
        }
        handled
    }

    pub fn take_work(&self) -> Vec<WorkTask> {
        self.work.lock().drain(..).collect()
    }

    pub fn handle_all_work(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let tasks = self.take_work();
            if tasks.is_empty() {
                return outcomes;
            }
            outcomes.extend(tasks.into_iter().map(|t| t.execute(&test_env())));
        }
    }
}

impl WorkEmitter for RecordingEmitter {
    fn emit_work(&self, task: WorkTask, _policy: ContinuationPolicy) -> bool {
        if self.refuse_work.load(Ordering::SeqCst) {
            return false;
        }
        self.work.lock().push(task);
        true
    }

    fn emit_pipeline_start(&self, task: StartPipelineTask) {
        self.setups.lock().push(task);
    }

    fn emit_pipeline_stop(&self, task: StopPipelineTask) {
        self.terminations.lock().push(task);
    }
}

/// Keeps source stop and failure requests until the test handles them.
#[derive(Default)]
pub struct RecordingController {
    stops: Mutex<Vec<StopSourceTask>>,
    failures: Mutex<Vec<FailSourceTask>>,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// Attempt the stop request of `origin_id`. A request that asks for a
    /// retry stays queued.
    pub fn handle_stop(&self, origin_id: OriginId) -> Option<SourceStopAttempt> {
        let task = {
            let mut stops = self.stops.lock();
            let position = stops.iter().position(|t| t.origin_id() == origin_id)?;
            stops.remove(position)
        };
        let attempt = task.attempt(Duration::from_millis(1));
        if attempt == SourceStopAttempt::Retry {
            self.stops.lock().push(task);
        }
        Some(attempt)
    }

    pub fn handle_all_stops(&self) -> Vec<SourceStopAttempt> {
        let tasks: Vec<_> = self.stops.lock().drain(..).collect();
        tasks
            .into_iter()
            .map(|t| t.attempt(Duration::from_millis(1)))
            .collect()
    }

    pub fn handle_failure(&self, origin_id: OriginId) -> Option<TaskOutcome> {
        let task = {
            let mut failures = self.failures.lock();
            let position = failures.iter().position(|t| t.origin_id() == origin_id)?;
            failures.remove(position)
        };
        Some(task.execute())
    }
}

impl QueryLifetimeController for RecordingController {
    fn initialize_source_stop(&self, task: StopSourceTask) {
        self.stops.lock().push(task);
    }

    fn initialize_source_failure(&self, task: FailSourceTask) {
        self.failures.lock().push(task);
    }
}

/// Counts lifetime notifications of one plan.
#[derive(Default)]
pub struct CountingListener {
    running: AtomicUsize,
    destruction: AtomicUsize,
    failures: Mutex<Vec<String>>,
    source_terminations: Mutex<Vec<(OriginId, QueryTerminationType)>>,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn destructions(&self) -> usize {
        self.destruction.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn source_terminations(&self) -> Vec<(OriginId, QueryTerminationType)> {
        self.source_terminations.lock().clone()
    }
}

impl QueryLifetimeListener for CountingListener {
    fn on_running(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: EngineError) {
        self.failures.lock().push(error.to_string());
    }

    fn on_destruction(&self) {
        self.destruction.fetch_add(1, Ordering::SeqCst);
    }

    fn on_source_termination(&self, origin_id: OriginId, termination: QueryTerminationType) {
        self.source_terminations.lock().push((origin_id, termination));
    }
}

/// Records every status change the engine reports.
#[derive(Default)]
pub struct RecordingStatusListener {
    changes: Mutex<Vec<(QueryId, QueryStatus)>>,
    failures: Mutex<Vec<(QueryId, String)>>,
    source_terminations: Mutex<Vec<(QueryId, OriginId, QueryTerminationType)>>,
    changed: Condvar,
}

impl RecordingStatusListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self, query_id: QueryId) -> Vec<QueryStatus> {
        self.changes
            .lock()
            .iter()
            .filter(|(q, _)| *q == query_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn failures(&self, query_id: QueryId) -> Vec<String> {
        self.failures
            .lock()
            .iter()
            .filter(|(q, _)| *q == query_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn source_terminations(&self, query_id: QueryId) -> Vec<(OriginId, QueryTerminationType)> {
        self.source_terminations
            .lock()
            .iter()
            .filter(|(q, _, _)| *q == query_id)
            .map(|(_, o, t)| (*o, *t))
            .collect()
    }

    /// Block until `query_id` reported `status`.
    pub fn wait_for(&self, query_id: QueryId, status: QueryStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.changes.lock();
        loop {
            if changes.iter().any(|&(q, s)| q == query_id && s == status) {
                return true;
            }
            if self.changed.wait_until(&mut changes, deadline).timed_out() {
                return changes.iter().any(|&(q, s)| q == query_id && s == status);
            }
        }
    }
}

impl QueryStatusListener for RecordingStatusListener {
    fn log_query_status_change(&self, query_id: QueryId, status: QueryStatus, _at: SystemTime) {
        self.changes.lock().push((query_id, status));
        self.changed.notify_all();
    }

    fn log_query_failure(&self, query_id: QueryId, error: &EngineError, _at: SystemTime) {
        self.failures.lock().push((query_id, error.to_string()));
    }

    fn log_source_termination(
        &self,
        query_id: QueryId,
        origin_id: OriginId,
        termination: QueryTerminationType,
        _at: SystemTime,
    ) {
        self.source_terminations
            .lock()
            .push((query_id, origin_id, termination));
    }
}

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    Started(PipelineId),
    Executed(PipelineId, u64),
    Stopped(PipelineId),
}

pub type Journal = Arc<Mutex<Vec<StageEvent>>>;

/// Knobs and counters of one [`TestStage`], shared with the test.
#[derive(Default)]
pub struct StageMonitor {
    pub started: AtomicUsize,
    pub executed: AtomicUsize,
    pub stopped: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_execute: AtomicBool,
    pub fail_stop: AtomicBool,
    /// Forward every buffer to the successors.
    pub forward: AtomicBool,
    /// Emit one buffer with this many tuples from the stop hook.
    pub flush_on_stop: Mutex<Option<u64>>,
}

impl StageMonitor {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct TestStage {
    id: PipelineId,
    monitor: Arc<StageMonitor>,
    journal: Journal,
}

impl TestStage {
    pub fn new(id: PipelineId, monitor: Arc<StageMonitor>, journal: Journal) -> Self {
        Self { id, monitor, journal }
    }
}

impl ExecutablePipelineStage for TestStage {
    fn start(&self, _ctx: &dyn PipelineExecutionContext) -> Result<()> {
        if self.monitor.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Stage(format!("pipeline {} failed to start", self.id)));
        }
        self.monitor.started.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(StageEvent::Started(self.id));
        Ok(())
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &dyn PipelineExecutionContext) -> Result<()> {
        if self.monitor.fail_execute.load(Ordering::SeqCst) {
            return Err(EngineError::Stage(format!("pipeline {} failed to execute", self.id)));
        }
        self.monitor.executed.fetch_add(1, Ordering::SeqCst);
        self.journal
            .lock()
            .push(StageEvent::Executed(self.id, buffer.number_of_tuples()));
        if self.monitor.forward.load(Ordering::SeqCst) {
            ctx.emit_buffer(buffer.clone(), ContinuationPolicy::Possible);
        }
        Ok(())
    }

    fn stop(&self, ctx: &dyn PipelineExecutionContext) -> Result<()> {
        self.monitor.stopped.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(StageEvent::Stopped(self.id));
        if let Some(tuples) = *self.monitor.flush_on_stop.lock() {
            ctx.emit_buffer(buffer(tuples), ContinuationPolicy::Possible);
        }
        if self.monitor.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::Stage(format!("pipeline {} failed to stop", self.id)));
        }
        Ok(())
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Controls and observes one [`TestSource`] from the test thread.
#[derive(Default)]
pub struct SourceControl {
    emit: Mutex<Option<SourceEmitFn>>,
    opened: AtomicBool,
    closed: AtomicBool,
    destroyed: AtomicBool,
    stop_calls: AtomicUsize,
    fail_start: AtomicBool,
    /// `try_stop` reports pending reads this many more times.
    pending_stops: AtomicUsize,
}

impl SourceControl {
    pub fn was_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn delay_stop(&self, attempts: usize) {
        self.pending_stops.store(attempts, Ordering::SeqCst);
    }

    fn emit(&self, event: SourceEvent) -> bool {
        // Cloned out so the event is delivered without holding the lock.
        let emit = self.emit.lock().clone();
        match emit {
            Some(emit) => {
                emit(event);
                true
            }
            None => false,
        }
    }

    pub fn inject_data(&self, tuples: u64) -> bool {
        self.emit(SourceEvent::Data(buffer(tuples)))
    }

    pub fn inject_eos(&self) -> bool {
        self.emit(SourceEvent::EndOfStream)
    }

    pub fn inject_error(&self, message: &str) -> bool {
        self.emit(SourceEvent::Error(EngineError::Source(message.to_string())))
    }
}

pub struct TestSource {
    control: Arc<SourceControl>,
}

impl TestSource {
    pub fn new(control: Arc<SourceControl>) -> Self {
        Self { control }
    }
}

impl DataSource for TestSource {
    fn start(&mut self, emit: SourceEmitFn) -> Result<()> {
        if self.control.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Source("source refused to open".into()));
        }
        *self.control.emit.lock() = Some(emit);
        self.control.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn try_stop(&mut self, _timeout: Duration) -> Result<SourceStopOutcome> {
        let pending = self.control.pending_stops.load(Ordering::SeqCst);
        if pending > 0 {
            self.control.pending_stops.store(pending - 1, Ordering::SeqCst);
            return Ok(SourceStopOutcome::Pending);
        }
        self.stop()?;
        Ok(SourceStopOutcome::Stopped)
    }

    fn stop(&mut self) -> Result<()> {
        self.control.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.control.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for TestSource {
    fn drop(&mut self) {
        self.control.destroyed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Plan builder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Source(OriginId),
    Pipeline(PipelineId),
}

impl NodeRef {
    pub fn pipeline(self) -> PipelineId {
        match self {
            NodeRef::Pipeline(id) => id,
            NodeRef::Source(id) => panic!("source {} is not a pipeline", id),
        }
    }

    pub fn origin(self) -> OriginId {
        match self {
            NodeRef::Source(id) => id,
            NodeRef::Pipeline(id) => panic!("pipeline {} is not a source", id),
        }
    }
}

/// Monitors of a built plan.
pub struct TestQuery {
    pub query_id: QueryId,
    pub stages: HashMap<PipelineId, Arc<StageMonitor>>,
    pub sources: HashMap<OriginId, Arc<SourceControl>>,
    pub journal: Journal,
}

impl TestQuery {
    pub fn stage(&self, node: NodeRef) -> &StageMonitor {
        &self.stages[&node.pipeline()]
    }

    pub fn source(&self, node: NodeRef) -> &SourceControl {
        &self.sources[&node.origin()]
    }

    pub fn journal(&self) -> Vec<StageEvent> {
        self.journal.lock().clone()
    }

    pub fn stops(&self) -> Vec<PipelineId> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                StageEvent::Stopped(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

/// Builds plans from a predecessor list, the way a query compiler would
/// hand them over.
pub struct QueryPlanBuilder {
    query_id: QueryId,
    next_pipeline: u64,
    next_origin: u64,
    pipelines: Vec<PipelineId>,
    origins: Vec<OriginId>,
    edges: Vec<(NodeRef, PipelineId)>,
    stages: HashMap<PipelineId, Arc<StageMonitor>>,
    sources: HashMap<OriginId, Arc<SourceControl>>,
}

impl QueryPlanBuilder {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            next_pipeline: 1,
            next_origin: 1,
            pipelines: Vec::new(),
            origins: Vec::new(),
            edges: Vec::new(),
            stages: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    pub fn add_source(&mut self) -> NodeRef {
        let id = OriginId::new(self.next_origin);
        self.next_origin += 1;
        self.origins.push(id);
        self.sources.insert(id, Arc::new(SourceControl::default()));
        NodeRef::Source(id)
    }

    pub fn add_pipeline(&mut self, predecessors: &[NodeRef]) -> NodeRef {
        let id = PipelineId::new(self.next_pipeline);
        self.next_pipeline += 1;
        self.pipelines.push(id);
        self.stages.insert(id, Arc::new(StageMonitor::default()));
        for predecessor in predecessors {
            self.edges.push((*predecessor, id));
        }
        NodeRef::Pipeline(id)
    }

    pub fn add_sink(&mut self, predecessors: &[NodeRef]) -> NodeRef {
        self.add_pipeline(predecessors)
    }

    pub fn stage(&self, node: NodeRef) -> &StageMonitor {
        &self.stages[&node.pipeline()]
    }

    fn successors_of(&self, node: NodeRef) -> Vec<PipelineId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn build(self) -> (ExecutableQueryPlan, TestQuery) {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let pipelines = self
            .pipelines
            .iter()
            .map(|&id| {
                ExecutablePipeline::new(
                    id,
                    Box::new(TestStage::new(
                        id,
                        Arc::clone(&self.stages[&id]),
                        Arc::clone(&journal),
                    )),
                    self.successors_of(NodeRef::Pipeline(id)),
                )
            })
            .collect();
        let sources = self
            .origins
            .iter()
            .map(|&id| {
                ExecutableSource::new(
                    id,
                    Box::new(TestSource::new(Arc::clone(&self.sources[&id]))),
                    self.successors_of(NodeRef::Source(id)),
                )
            })
            .collect();

        let plan = ExecutableQueryPlan::new(self.query_id, pipelines, sources);
        let query = TestQuery {
            query_id: self.query_id,
            stages: self.stages,
            sources: self.sources,
            journal,
        };
        (plan, query)
    }
}
