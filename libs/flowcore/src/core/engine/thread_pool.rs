// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Reference worker pool.
//!
//! Two bounded queues feed the workers:
//! - admission: submissions from threads outside the pool (sources, callers).
//!   Full means the submitter blocks.
//! - internal: submissions from the workers themselves. A worker never blocks
//!   on it; when it is full the worker runs queued tasks in place until its
//!   own submission fits.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::core::buffers::BufferProvider;
use crate::core::config::QueryEngineConfig;
use crate::core::delegates::{QueryLifetimeController, WorkEmitter};
use crate::core::engine::catalog::QueryCatalog;
use crate::core::engine::statistics::{EngineEvent, StatisticListener};
use crate::core::error::{EngineError, Result};
use crate::core::execution::{ContinuationPolicy, WorkerEnvironment};
use crate::core::ids::{QueryId, TaskId, WorkerThreadId};
use crate::core::plan::ExecutableQueryPlan;
use crate::core::tasks::{
    FailSourceTask, SourceStopAttempt, StartPipelineTask, StopPipelineTask, StopSourceTask,
    TaskOutcome, WorkTask,
};

/// How long a `Repeat`/`Never` work submission may wait for queue space.
const WORK_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

thread_local! {
    /// (pool identity, worker id) of the pool this thread works for.
    static CURRENT_WORKER: Cell<Option<(usize, WorkerThreadId)>> = const { Cell::new(None) };
    /// Tasks currently executing in place on this thread.
    static IN_PLACE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub(crate) enum EngineTask {
    Work {
        task_id: TaskId,
        task: WorkTask,
    },
    StartPipeline(StartPipelineTask),
    StopPipeline(StopPipelineTask),
    StopSource(StopSourceTask),
    FailSource(FailSourceTask),
    StartQuery {
        query_id: QueryId,
        plan: ExecutableQueryPlan,
        catalog: Weak<QueryCatalog>,
    },
    StopQuery {
        query_id: QueryId,
        catalog: Weak<QueryCatalog>,
    },
}

impl EngineTask {
    fn query_id(&self) -> QueryId {
        match self {
            EngineTask::Work { task, .. } => task.query_id(),
            EngineTask::StartPipeline(task) => task.query_id(),
            EngineTask::StopPipeline(task) => task.query_id(),
            EngineTask::StopSource(task) => task.query_id(),
            EngineTask::FailSource(task) => task.query_id(),
            EngineTask::StartQuery { query_id, .. } | EngineTask::StopQuery { query_id, .. } => {
                *query_id
            }
        }
    }

    /// Give up on a task that could not be queued.
    fn fail(self, error: EngineError) {
        let query_id = self.query_id();
        match self {
            EngineTask::StartPipeline(task) => task.fail(error),
            EngineTask::StopPipeline(task) => task.fail(error),
            other => {
                tracing::warn!(
                    "[{}] Dropping {} task: {}",
                    query_id,
                    other.kind(),
                    error
                );
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EngineTask::Work { .. } => "work",
            EngineTask::StartPipeline(_) => "pipeline start",
            EngineTask::StopPipeline(_) => "pipeline stop",
            EngineTask::StopSource(_) => "source stop",
            EngineTask::FailSource(_) => "source failure",
            EngineTask::StartQuery { .. } => "query start",
            EngineTask::StopQuery { .. } => "query stop",
        }
    }
}

struct PoolShared {
    self_ref: Weak<PoolShared>,
    admission_tx: Sender<EngineTask>,
    admission_rx: Receiver<EngineTask>,
    internal_tx: Sender<EngineTask>,
    internal_rx: Receiver<EngineTask>,
    number_of_threads: usize,
    max_in_place_recursion: usize,
    source_stop_timeout: Duration,
    buffer_provider: Arc<dyn BufferProvider>,
    statistics: Arc<dyn StatisticListener>,
    terminating: AtomicBool,
    next_task_id: AtomicU64,
}

impl PoolShared {
    fn identity(&self) -> usize {
        self as *const Self as usize
    }

    fn current_worker(&self) -> Option<WorkerThreadId> {
        CURRENT_WORKER
            .with(Cell::get)
            .filter(|(pool, _)| *pool == self.identity())
            .map(|(_, thread)| thread)
    }

    fn environment(&self, thread: WorkerThreadId) -> WorkerEnvironment {
        WorkerEnvironment::new(
            thread,
            self.number_of_threads,
            Arc::clone(&self.buffer_provider),
        )
    }

    fn next_task_id(&self) -> TaskId {
        TaskId::new(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, task: EngineTask) {
        if self.terminating.load(Ordering::Acquire) {
            // No workers left; run (or skip) the task right here.
            let env = self.environment(WorkerThreadId::TERMINATOR);
            self.execute_terminating(task, &env);
            return;
        }

        match self.current_worker() {
            Some(thread) => self.add_or_do_next(task, thread),
            None => {
                if let Err(e) = self.admission_tx.send(task) {
                    e.into_inner()
                        .fail(EngineError::Runtime("admission queue closed".into()));
                }
            }
        }
    }

    /// Queue `task` internally. While the queue is full, run the next queued
    /// task in place and retry.
    fn add_or_do_next(&self, mut task: EngineTask, thread: WorkerThreadId) {
        loop {
            match self.internal_tx.try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    task = returned;
                    if IN_PLACE_DEPTH.with(Cell::get) >= self.max_in_place_recursion {
                        tracing::error!(
                            "[worker-{}] Internal queue full at in-place depth {}",
                            thread,
                            self.max_in_place_recursion
                        );
                        task.fail(EngineError::QueueFull(format!(
                            "internal task queue full after {} in-place executions",
                            self.max_in_place_recursion
                        )));
                        return;
                    }
                    if let Ok(next) = self.internal_rx.try_recv() {
                        self.execute_in_place(next, thread);
                    }
                }
                Err(TrySendError::Disconnected(returned)) => {
                    returned.fail(EngineError::Runtime("internal queue closed".into()));
                    return;
                }
            }
        }
    }

    /// Queue `task` internally, or run it right here if the queue is full.
    fn add_or_do_in_place(&self, task: EngineTask, thread: WorkerThreadId) -> bool {
        match self.internal_tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                if IN_PLACE_DEPTH.with(Cell::get) >= self.max_in_place_recursion {
                    return self
                        .internal_tx
                        .send_timeout(task, WORK_SUBMIT_TIMEOUT)
                        .is_ok();
                }
                self.execute_in_place(task, thread);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn execute_in_place(&self, task: EngineTask, thread: WorkerThreadId) {
        IN_PLACE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        self.execute(task, &self.environment(thread));
        IN_PLACE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }

    fn execute(&self, task: EngineTask, env: &WorkerEnvironment) {
        if self.terminating.load(Ordering::Acquire) {
            self.execute_terminating(task, env);
            return;
        }

        let thread = env.worker_thread_id;
        match task {
            EngineTask::Work { task_id, task } => {
                let query_id = task.query_id();
                let pipeline_id = task.pipeline_id();
                self.statistics.on_event(EngineEvent::TaskExecutionStart {
                    thread,
                    query_id,
                    pipeline_id,
                    task_id,
                    number_of_tuples: task.buffer().number_of_tuples(),
                    at: Instant::now(),
                });
                let event = match task.execute(env) {
                    TaskOutcome::Expired => EngineEvent::TaskExpired {
                        thread,
                        query_id,
                        pipeline_id,
                        task_id,
                        at: Instant::now(),
                    },
                    _ => {
                        EngineEvent::TaskExecutionComplete {
                            thread,
                            query_id,
                            pipeline_id,
                            task_id,
                            at: Instant::now(),
                        }
                    }
                };
                self.statistics.on_event(event);
            }
            EngineTask::StartPipeline(task) => {
                let query_id = task.query_id();
                let pipeline_id = task.pipeline_id();
                tracing::trace!("[{}-{}] Running setup on worker {}", query_id, pipeline_id, thread);
                if task.execute(env) == TaskOutcome::Completed {
                    self.statistics.on_event(EngineEvent::PipelineStart {
                        thread,
                        query_id,
                        pipeline_id,
                        at: Instant::now(),
                    });
                }
            }
            EngineTask::StopPipeline(task) => {
                let query_id = task.query_id();
                let pipeline_id = task.pipeline_id();
                tracing::trace!("[{}-{}] Running termination on worker {}", query_id, pipeline_id, thread);
                if task.execute(env) == TaskOutcome::Deferred {
                    // The pending buffers may still sit in the admission queue
                    // behind the re-queued stop.
                    if let Ok(next) = self.admission_rx.try_recv() {
                        self.execute_in_place(next, thread);
                    }
                    return;
                }
                self.statistics.on_event(EngineEvent::PipelineStop {
                    thread,
                    query_id,
                    pipeline_id,
                    at: Instant::now(),
                });
            }
            EngineTask::StopSource(task) => {
                if task.attempt(self.source_stop_timeout) == SourceStopAttempt::Retry {
                    self.submit(EngineTask::StopSource(task));
                }
            }
            EngineTask::FailSource(task) => {
                task.execute();
            }
            EngineTask::StartQuery {
                query_id,
                plan,
                catalog,
            } => {
                self.statistics.on_event(EngineEvent::QueryStart {
                    thread,
                    query_id,
                    at: Instant::now(),
                });
                let (Some(catalog), Some(pool)) = (catalog.upgrade(), self.self_ref.upgrade()) else {
                    tracing::warn!("[{}] Engine gone, dropping query start", query_id);
                    return;
                };
                let controller: Arc<dyn QueryLifetimeController> = pool.clone();
                let emitter: Arc<dyn WorkEmitter> = pool;
                if let Err(e) = catalog.start(query_id, plan, controller, emitter) {
                    tracing::warn!("[{}] Query did not start: {}", query_id, e);
                }
            }
            EngineTask::StopQuery { query_id, catalog } => {
                if let Some(catalog) = catalog.upgrade() {
                    if let Err(e) = catalog.stop(query_id) {
                        tracing::warn!("[{}] Query did not stop: {}", query_id, e);
                    }
                }
                self.statistics.on_event(EngineEvent::QueryStop {
                    thread,
                    query_id,
                    at: Instant::now(),
                });
            }
        }
    }

    /// Shutdown semantics: only teardown work still runs. Queued buffers are
    /// skipped, so pipeline stops no longer wait for them.
    fn execute_terminating(&self, task: EngineTask, env: &WorkerEnvironment) {
        match task {
            EngineTask::StopPipeline(task) => {
                task.execute_now(env);
            }
            EngineTask::FailSource(task) => {
                task.execute();
            }
            EngineTask::StopSource(task) => {
                if task.attempt(self.source_stop_timeout) == SourceStopAttempt::Retry {
                    tracing::warn!(
                        "[{}] Source {} still busy during shutdown, leaving it to plan teardown",
                        task.query_id(),
                        task.origin_id()
                    );
                }
            }
            EngineTask::StopQuery { query_id, catalog } => {
                if let Some(catalog) = catalog.upgrade() {
                    if let Err(e) = catalog.stop(query_id) {
                        tracing::warn!("[{}] Query did not stop: {}", query_id, e);
                    }
                }
            }
            skipped => {
                tracing::debug!(
                    "[{}] Skipping {} task during shutdown",
                    skipped.query_id(),
                    skipped.kind()
                );
            }
        }
    }

    fn drain(&self) {
        let env = self.environment(WorkerThreadId::TERMINATOR);
        let mut drained = 0usize;
        while let Ok(task) = self
            .internal_rx
            .try_recv()
            .or_else(|_| self.admission_rx.try_recv())
        {
            self.execute_terminating(task, &env);
            drained += 1;
        }
        tracing::debug!("Drained {} tasks during shutdown", drained);
    }
}

impl WorkEmitter for PoolShared {
    fn emit_work(&self, task: WorkTask, policy: ContinuationPolicy) -> bool {
        if self.terminating.load(Ordering::Acquire) {
            tracing::debug!(
                "[{}-{}] Refusing work during shutdown",
                task.query_id(),
                task.pipeline_id()
            );
            return false;
        }

        let task_id = self.next_task_id();
        let thread = self.current_worker();
        let event = EngineEvent::TaskEmit {
            thread: thread.unwrap_or(WorkerThreadId::EXTERNAL),
            query_id: task.query_id(),
            pipeline_id: task.pipeline_id(),
            task_id,
            number_of_tuples: task.buffer().number_of_tuples(),
            at: Instant::now(),
        };
        let task = EngineTask::Work { task_id, task };

        let accepted = match (thread, policy) {
            (Some(thread), ContinuationPolicy::Possible) => self.add_or_do_in_place(task, thread),
            (Some(_), _) => self
                .internal_tx
                .send_timeout(task, WORK_SUBMIT_TIMEOUT)
                .is_ok(),
            (None, ContinuationPolicy::Possible) => self.admission_tx.send(task).is_ok(),
            (None, _) => self
                .admission_tx
                .send_timeout(task, WORK_SUBMIT_TIMEOUT)
                .is_ok(),
        };
        if accepted {
            self.statistics.on_event(event);
        }
        accepted
    }

    fn emit_pipeline_start(&self, task: StartPipelineTask) {
        self.submit(EngineTask::StartPipeline(task));
    }

    fn emit_pipeline_stop(&self, task: StopPipelineTask) {
        self.submit(EngineTask::StopPipeline(task));
    }
}

impl QueryLifetimeController for PoolShared {
    fn initialize_source_stop(&self, task: StopSourceTask) {
        self.submit(EngineTask::StopSource(task));
    }

    fn initialize_source_failure(&self, task: FailSourceTask) {
        self.submit(EngineTask::FailSource(task));
    }
}

/// Fixed set of worker threads executing pipeline, source and query tasks.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    shutdown_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(
        config: &QueryEngineConfig,
        statistics: Arc<dyn StatisticListener>,
        buffer_provider: Arc<dyn BufferProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let (admission_tx, admission_rx) = bounded(config.admission_queue_size);
        let (internal_tx, internal_rx) = bounded(config.task_queue_size);
        let shared = Arc::new_cyclic(|self_ref| PoolShared {
            self_ref: self_ref.clone(),
            admission_tx,
            admission_rx,
            internal_tx,
            internal_rx,
            number_of_threads: config.number_of_worker_threads,
            max_in_place_recursion: config.max_in_place_recursion,
            source_stop_timeout: config.source_stop_timeout(),
            buffer_provider,
            statistics,
            terminating: AtomicBool::new(false),
            next_task_id: AtomicU64::new(TaskId::INITIAL.raw()),
        });

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut pool = Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            workers: Vec::with_capacity(config.number_of_worker_threads),
        };

        for n in 0..config.number_of_worker_threads {
            let shared = Arc::clone(&pool.shared);
            let shutdown_rx = shutdown_rx.clone();
            let thread = WorkerThreadId::new(n as u64);
            let handle = std::thread::Builder::new()
                .name(format!("flowcore-worker-{}", n))
                .spawn(move || run_worker(shared, thread, shutdown_rx))?;
            pool.workers.push(handle);
        }

        tracing::info!(
            "Worker pool started ({} threads, queues {}/{})",
            config.number_of_worker_threads,
            config.admission_queue_size,
            config.task_queue_size
        );
        Ok(pool)
    }

    pub fn emitter(&self) -> Arc<dyn WorkEmitter> {
        self.shared.clone()
    }

    pub fn controller(&self) -> Arc<dyn QueryLifetimeController> {
        self.shared.clone()
    }

    pub fn number_of_threads(&self) -> usize {
        self.shared.number_of_threads
    }

    pub fn buffer_provider(&self) -> Arc<dyn BufferProvider> {
        Arc::clone(&self.shared.buffer_provider)
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::Acquire)
    }

    pub(crate) fn submit(&self, task: EngineTask) {
        self.shared.submit(task);
    }

    /// Run `f` with the current thread acting as the pool's terminator.
    pub(crate) fn as_terminator<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT_WORKER.with(|current| {
            current.replace(Some((self.shared.identity(), WorkerThreadId::TERMINATOR)))
        });
        let result = f();
        CURRENT_WORKER.with(|current| current.set(previous));
        result
    }

    /// Stop and join the workers, then run what is left in the queues in
    /// terminating mode on the calling thread. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        tracing::info!("Shutting down worker pool");
        drop(shutdown_tx);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }

        self.shared.terminating.store(true, Ordering::Release);
        self.as_terminator(|| self.shared.drain());
        tracing::info!("Worker pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.shared.number_of_threads)
            .field("workers_alive", &self.workers.len())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

fn run_worker(shared: Arc<PoolShared>, thread: WorkerThreadId, shutdown_rx: Receiver<()>) {
    CURRENT_WORKER.with(|current| current.set(Some((shared.identity(), thread))));
    let env = shared.environment(thread);
    tracing::debug!("[worker-{}] Started", thread);

    loop {
        // Internal work first: it is what keeps running queries moving.
        if let Ok(task) = shared.internal_rx.try_recv() {
            shared.execute(task, &env);
            continue;
        }
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => break,
            recv(shared.internal_rx) -> msg => {
                if let Ok(task) = msg {
                    shared.execute(task, &env);
                }
            }
            recv(shared.admission_rx) -> msg => {
                if let Ok(task) = msg {
                    shared.execute(task, &env);
                }
            }
        }
    }

    CURRENT_WORKER.with(|current| current.set(None));
    tracing::debug!("[worker-{}] Stopped", thread);
}
