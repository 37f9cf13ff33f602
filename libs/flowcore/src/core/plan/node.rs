// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::core::buffers::TupleBuffer;
use crate::core::completion::CompletionToken;
use crate::core::delegates::WorkEmitter;
use crate::core::error::{EngineError, ErrorHandler, Result};
use crate::core::execution::{
    DefaultExecutionContext, Emission, ExecutablePipelineStage, OperatorHandlers,
    WorkerEnvironment,
};
use crate::core::ids::{PipelineId, QueryId};
use crate::core::plan::TeardownPolicy;
use crate::core::tasks::{StartPipelineTask, StopPipelineTask, TaskOutcome};

/// Everything a node owns, shared with the work addressed to it.
///
/// The [`PipelineNode`] handle keeps it alive while predecessors exist; a
/// [`RetiredNode`] keeps it alive until the stop hook has run, so buffers
/// queued before retirement are still processed.
pub(crate) struct NodeCore {
    query_id: QueryId,
    pipeline_id: PipelineId,
    stage: Box<dyn ExecutablePipelineStage>,
    successors: Vec<Arc<PipelineNode>>,
    emitter: Arc<dyn WorkEmitter>,
    handlers: OperatorHandlers,
    on_error: ErrorHandler,
    policy: Arc<TeardownPolicy>,
    setup_complete: AtomicBool,
    pending: Arc<AtomicUsize>,
    handle: Weak<PipelineNode>,
    this: Weak<NodeCore>,
    // Released last, after the successors.
    _expiration: CompletionToken,
}

impl NodeCore {
    fn is_set_up(&self) -> bool {
        self.setup_complete.load(Ordering::Acquire)
    }

    pub(crate) fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub(crate) fn successors(&self) -> &[Arc<PipelineNode>] {
        &self.successors
    }

    pub(crate) fn emitter(&self) -> &dyn WorkEmitter {
        &*self.emitter
    }

    pub(crate) fn target(&self) -> WorkTarget {
        WorkTarget {
            pipeline_id: self.pipeline_id,
            node: self.handle.clone(),
            core: self.this.clone(),
            pending: Arc::clone(&self.pending),
        }
    }

    fn report(&self, error: EngineError) {
        (self.on_error)(error);
    }

    fn execute_buffer(&self, buffer: &TupleBuffer, env: &WorkerEnvironment) -> Result<()> {
        if !self.is_set_up() {
            tracing::warn!(
                "[{}-{}] Skipping buffer for pipeline that is not set up",
                self.query_id,
                self.pipeline_id
            );
            return Ok(());
        }
        let ctx = DefaultExecutionContext::new(
            env,
            self.query_id,
            self.pipeline_id,
            &self.handlers,
            Emission::Forward(self),
        );
        self.stage.execute(buffer, &ctx)
    }
}

pub(crate) struct NodeParts {
    pub query_id: QueryId,
    pub pipeline_id: PipelineId,
    pub emitter: Arc<dyn WorkEmitter>,
    pub successors: Vec<Arc<PipelineNode>>,
    pub stage: Box<dyn ExecutablePipelineStage>,
    pub handlers: OperatorHandlers,
    pub on_error: ErrorHandler,
    pub policy: Arc<TeardownPolicy>,
    pub expiration: CompletionToken,
}

/// One executable stage plus the nodes it feeds. Always handled as
/// `Arc<PipelineNode>`; every predecessor holds a strong reference.
pub struct PipelineNode {
    core: ManuallyDrop<Arc<NodeCore>>,
}

impl PipelineNode {
    /// Create a node and submit its setup task right away.
    ///
    /// The setup task reaches the node through a weak reference and holds
    /// `setup` until it is done. `expiration` is held until the node has been
    /// fully torn down.
    pub fn create(
        query_id: QueryId,
        pipeline_id: PipelineId,
        emitter: Arc<dyn WorkEmitter>,
        successors: Vec<Arc<PipelineNode>>,
        stage: Box<dyn ExecutablePipelineStage>,
        on_error: ErrorHandler,
        expiration: CompletionToken,
        setup: CompletionToken,
    ) -> Arc<Self> {
        Self::build(
            NodeParts {
                query_id,
                pipeline_id,
                emitter,
                successors,
                stage,
                handlers: OperatorHandlers::default(),
                on_error,
                policy: Arc::new(TeardownPolicy::default()),
                expiration,
            },
            setup,
        )
    }

    pub(crate) fn build(parts: NodeParts, setup: CompletionToken) -> Arc<Self> {
        let node = Arc::new_cyclic(|handle| Self {
            core: ManuallyDrop::new(Arc::new_cyclic(|this| NodeCore {
                query_id: parts.query_id,
                pipeline_id: parts.pipeline_id,
                stage: parts.stage,
                successors: parts.successors,
                emitter: parts.emitter,
                handlers: parts.handlers,
                on_error: parts.on_error,
                policy: parts.policy,
                setup_complete: AtomicBool::new(false),
                pending: Arc::new(AtomicUsize::new(0)),
                handle: handle.clone(),
                this: this.clone(),
                _expiration: parts.expiration,
            })),
        });

        tracing::debug!(
            "[{}-{}] Created pipeline node ({} successors)",
            node.core.query_id,
            node.core.pipeline_id,
            node.core.successors.len()
        );

        let task = StartPipelineTask::new(
            node.core.query_id,
            node.core.pipeline_id,
            Arc::downgrade(&node),
            Arc::clone(&node.core.on_error),
            setup,
        );
        node.core.emitter.emit_pipeline_start(task);
        node
    }

    pub fn query_id(&self) -> QueryId {
        self.core.query_id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.core.pipeline_id
    }

    pub fn successors(&self) -> &[Arc<PipelineNode>] {
        &self.core.successors
    }

    /// Whether the start hook has returned successfully.
    pub fn is_set_up(&self) -> bool {
        self.core.is_set_up()
    }

    /// Work tasks addressed to this node that have not finished yet.
    pub fn pending_work(&self) -> usize {
        self.core.pending.load(Ordering::Acquire)
    }

    /// Address for work tasks. Holds no strong reference to the node.
    pub fn target(&self) -> WorkTarget {
        self.core.target()
    }

    pub(crate) fn start_stage(&self, env: &WorkerEnvironment) -> Result<()> {
        let ctx = DefaultExecutionContext::new(
            env,
            self.core.query_id,
            self.core.pipeline_id,
            &self.core.handlers,
            Emission::Rejected,
        );
        self.core.stage.start(&ctx)?;
        self.core.setup_complete.store(true, Ordering::Release);
        tracing::debug!(
            "[{}-{}] Pipeline set up on worker {}",
            self.core.query_id,
            self.core.pipeline_id,
            env.worker_thread_id
        );
        Ok(())
    }
}

impl Drop for PipelineNode {
    fn drop(&mut self) {
        // SAFETY: `core` is never touched again; `self` is being destroyed.
        let core = unsafe { ManuallyDrop::take(&mut self.core) };
        let node = RetiredNode { core };

        if !node.core.is_set_up() {
            tracing::debug!(
                "[{}-{}] Releasing pipeline that never completed setup",
                node.core.query_id,
                node.core.pipeline_id
            );
            return;
        }

        if node.core.policy.is_hard() {
            tracing::debug!(
                "[{}-{}] Hard stop, stopping pipeline inline",
                node.core.query_id,
                node.core.pipeline_id
            );
            if let Err(e) = node.stop_stage(&WorkerEnvironment::teardown(), false) {
                node.report(e);
            }
            return;
        }

        tracing::trace!(
            "[{}-{}] Handing retired pipeline to a termination task ({} buffers pending)",
            node.core.query_id,
            node.core.pipeline_id,
            node.pending_work()
        );
        let emitter = Arc::clone(&node.core.emitter);
        emitter.emit_pipeline_stop(StopPipelineTask::new(node));
    }
}

impl fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineNode")
            .field("query_id", &self.core.query_id)
            .field("pipeline_id", &self.core.pipeline_id)
            .field("successors", &self.core.successors.len())
            .field("set_up", &self.is_set_up())
            .field("pending_work", &self.pending_work())
            .finish()
    }
}

/// A node nobody references anymore, owned by whoever stops it.
///
/// Work queued before retirement can still reach the node until the stop
/// hook has run. Dropping it releases the successors, which may retire them
/// in turn.
pub struct RetiredNode {
    core: Arc<NodeCore>,
}

impl RetiredNode {
    pub fn query_id(&self) -> QueryId {
        self.core.query_id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.core.pipeline_id
    }

    pub fn successors(&self) -> &[Arc<PipelineNode>] {
        &self.core.successors
    }

    pub fn pending_work(&self) -> usize {
        self.core.pending.load(Ordering::Acquire)
    }

    pub(crate) fn emitter(&self) -> Arc<dyn WorkEmitter> {
        Arc::clone(&self.core.emitter)
    }

    pub(crate) fn report(&self, error: EngineError) {
        self.core.report(error);
    }

    /// Run the stop hook. A graceful stop forwards flushed buffers to the
    /// successors; a hard stop drops them.
    pub(crate) fn stop_stage(&self, env: &WorkerEnvironment, graceful: bool) -> Result<()> {
        let emission = if graceful {
            Emission::Flush {
                successors: &self.core.successors,
                emitter: &*self.core.emitter,
            }
        } else {
            Emission::Discard
        };
        let ctx = DefaultExecutionContext::new(
            env,
            self.core.query_id,
            self.core.pipeline_id,
            &self.core.handlers,
            emission,
        );
        let result = self.core.stage.stop(&ctx);
        tracing::debug!(
            "[{}-{}] Pipeline stopped{}",
            self.core.query_id,
            self.core.pipeline_id,
            if result.is_ok() { "" } else { " with error" }
        );
        result
    }
}

impl fmt::Debug for RetiredNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredNode")
            .field("query_id", &self.core.query_id)
            .field("pipeline_id", &self.core.pipeline_id)
            .field("pending_work", &self.pending_work())
            .finish()
    }
}

/// Where a work task delivers its buffer.
///
/// Only weak references: a target never keeps a node alive. The pending
/// counter is shared with the node so its stop can wait for queued work.
#[derive(Clone)]
pub struct WorkTarget {
    pipeline_id: PipelineId,
    node: Weak<PipelineNode>,
    core: Weak<NodeCore>,
    pending: Arc<AtomicUsize>,
}

impl WorkTarget {
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Whether neither the node nor a retired remainder of it is reachable.
    pub fn is_expired(&self) -> bool {
        self.node.strong_count() == 0 && self.core.strong_count() == 0
    }

    /// Count one more task for this node until the guard is dropped.
    pub(crate) fn claim(&self) -> PendingWork {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingWork {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Execute `buffer` on the node. A live node is kept alive for the
    /// duration of the hook; a retired one is reached through its core
    /// unless the plan switched to a hard stop.
    pub(crate) fn run(&self, buffer: &TupleBuffer, env: &WorkerEnvironment) -> TaskOutcome {
        let result = if let Some(node) = self.node.upgrade() {
            node.core.execute_buffer(buffer, env).map_err(|e| (e, Arc::clone(&node.core)))
        } else if let Some(core) = self.core.upgrade() {
            if core.policy.is_hard() {
                return TaskOutcome::Expired;
            }
            core.execute_buffer(buffer, env).map_err(|e| (e, core))
        } else {
            return TaskOutcome::Expired;
        };

        match result {
            Ok(()) => TaskOutcome::Completed,
            Err((e, core)) => {
                core.report(e);
                TaskOutcome::Failed
            }
        }
    }
}

impl fmt::Debug for WorkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkTarget")
            .field("pipeline_id", &self.pipeline_id)
            .field("expired", &self.is_expired())
            .finish()
    }
}

/// One unit of a node's pending work; released on drop.
pub(crate) struct PendingWork {
    pending: Arc<AtomicUsize>,
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}
