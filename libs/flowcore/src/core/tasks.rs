// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Units of work handed to a [`WorkEmitter`](crate::core::delegates::WorkEmitter)
//! or a [`QueryLifetimeController`](crate::core::delegates::QueryLifetimeController).
//!
//! Setup and work tasks reach their node through a [`Weak`] reference, so a
//! plan torn down hard while they are queued turns them into no-ops.
//! Termination tasks own the node outright and wait for the work still
//! pending on it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::core::buffers::TupleBuffer;
use crate::core::completion::CompletionToken;
use crate::core::error::{EngineError, ErrorHandler};
use crate::core::execution::WorkerEnvironment;
use crate::core::ids::{OriginId, PipelineId, QueryId};
use crate::core::plan::{PendingWork, PipelineNode, RetiredNode, SourceHandle, WorkTarget};

/// Result of executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The hook failed; the error went to the plan's listener.
    Failed,
    /// The target was already gone.
    Expired,
    /// Not run yet; the task was submitted again.
    Deferred,
}

/// Result of one attempt to unregister a source after end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStopAttempt {
    Stopped,
    /// In-flight reads are still completing; try again later.
    Retry,
    /// The plan already destroyed the source.
    Expired,
}

// ============================================================================
// Pipeline setup
// ============================================================================

/// Calls a node's start hook. Holds one token of the plan's setup pool until
/// the task is executed, failed or dropped.
pub struct StartPipelineTask {
    query_id: QueryId,
    pipeline_id: PipelineId,
    target: Weak<PipelineNode>,
    on_error: ErrorHandler,
    _setup: CompletionToken,
}

impl StartPipelineTask {
    pub(crate) fn new(
        query_id: QueryId,
        pipeline_id: PipelineId,
        target: Weak<PipelineNode>,
        on_error: ErrorHandler,
        setup: CompletionToken,
    ) -> Self {
        Self {
            query_id,
            pipeline_id,
            target,
            on_error,
            _setup: setup,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Whether the node can still be reached.
    pub fn is_expired(&self) -> bool {
        self.target.strong_count() == 0
    }

    pub fn execute(self, env: &WorkerEnvironment) -> TaskOutcome {
        let Some(node) = self.target.upgrade() else {
            tracing::warn!(
                "[{}-{}] Setup task expired before it ran",
                self.query_id,
                self.pipeline_id
            );
            return TaskOutcome::Expired;
        };

        match node.start_stage(env) {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                (self.on_error)(e);
                TaskOutcome::Failed
            }
        }
    }

    /// Give up on the task without running the start hook.
    pub fn fail(self, error: EngineError) {
        if self.is_expired() {
            tracing::debug!(
                "[{}-{}] Dropping failed setup of expired node: {}",
                self.query_id,
                self.pipeline_id,
                error
            );
            return;
        }
        (self.on_error)(error);
    }
}

impl fmt::Debug for StartPipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartPipelineTask")
            .field("query_id", &self.query_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("expired", &self.is_expired())
            .finish()
    }
}

// ============================================================================
// Pipeline termination
// ============================================================================

/// Calls the stop hook of a node nobody references anymore, then releases
/// the node's successors.
///
/// While buffers queued before retirement are still pending on the node the
/// task re-submits itself instead, so no buffer addressed to the node is lost.
pub struct StopPipelineTask {
    node: RetiredNode,
    attempts: usize,
}

impl StopPipelineTask {
    pub(crate) fn new(node: RetiredNode) -> Self {
        Self { node, attempts: 0 }
    }

    pub fn query_id(&self) -> QueryId {
        self.node.query_id()
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.node.pipeline_id()
    }

    /// Work tasks still pending on the node.
    pub fn pending_work(&self) -> usize {
        self.node.pending_work()
    }

    /// How often the task was deferred so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Stop the node once no work is pending on it. Otherwise the task goes
    /// back to the node's emitter and [`TaskOutcome::Deferred`] is returned.
    pub fn execute(mut self, env: &WorkerEnvironment) -> TaskOutcome {
        let pending = self.pending_work();
        if pending > 0 {
            self.attempts += 1;
            tracing::trace!(
                "[{}-{}] {} buffers still pending, deferring stop (attempt {})",
                self.query_id(),
                self.pipeline_id(),
                pending,
                self.attempts
            );
            let emitter = self.node.emitter();
            emitter.emit_pipeline_stop(self);
            return TaskOutcome::Deferred;
        }
        self.execute_now(env)
    }

    /// Run the stop hook regardless of pending work. Buffers still queued
    /// for the node expire.
    pub fn execute_now(self, env: &WorkerEnvironment) -> TaskOutcome {
        let outcome = match self.node.stop_stage(env, true) {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                self.node.report(e);
                TaskOutcome::Failed
            }
        };
        // Successors are released here, after the stop hook returned.
        drop(self.node);
        outcome
    }

    /// Give up on the stop hook. Successors are still released.
    pub fn fail(self, error: EngineError) {
        self.node.report(error);
    }
}

impl fmt::Debug for StopPipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopPipelineTask")
            .field("query_id", &self.query_id())
            .field("pipeline_id", &self.pipeline_id())
            .field("pending_work", &self.pending_work())
            .field("attempts", &self.attempts)
            .finish()
    }
}

// ============================================================================
// Buffer processing
// ============================================================================

/// Runs a node's execute hook on one buffer.
///
/// Counts as pending work on its node from creation until it is executed or
/// dropped.
pub struct WorkTask {
    query_id: QueryId,
    target: WorkTarget,
    buffer: TupleBuffer,
    keep_alive: Option<Arc<PipelineNode>>,
    pending: PendingWork,
}

impl WorkTask {
    pub fn new(query_id: QueryId, target: WorkTarget, buffer: TupleBuffer) -> Self {
        let pending = target.claim();
        Self {
            query_id,
            target,
            buffer,
            keep_alive: None,
            pending,
        }
    }

    /// Task that keeps its target alive until executed. Used for buffers
    /// flushed from a stop hook.
    pub fn keep_alive(query_id: QueryId, target: Arc<PipelineNode>, buffer: TupleBuffer) -> Self {
        let mut task = Self::new(query_id, target.target(), buffer);
        task.keep_alive = Some(target);
        task
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.target.pipeline_id()
    }

    pub fn buffer(&self) -> &TupleBuffer {
        &self.buffer
    }

    pub fn is_expired(&self) -> bool {
        self.keep_alive.is_none() && self.target.is_expired()
    }

    pub fn execute(self, env: &WorkerEnvironment) -> TaskOutcome {
        let WorkTask {
            query_id,
            target,
            buffer,
            keep_alive,
            pending,
        } = self;

        let outcome = target.run(&buffer, env);
        if outcome == TaskOutcome::Expired {
            tracing::warn!(
                "[{}-{}] Work task expired, dropping {} tuples",
                query_id,
                target.pipeline_id(),
                buffer.number_of_tuples()
            );
        }
        // No longer pending before the node may retire.
        drop(pending);
        drop(keep_alive);
        outcome
    }
}

impl fmt::Debug for WorkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkTask")
            .field("query_id", &self.query_id)
            .field("pipeline_id", &self.pipeline_id())
            .field("tuples", &self.buffer.number_of_tuples())
            .field("keep_alive", &self.keep_alive.is_some())
            .finish()
    }
}

// ============================================================================
// Source shutdown
// ============================================================================

/// Unregisters a source after it signalled end-of-stream.
pub struct StopSourceTask {
    query_id: QueryId,
    origin_id: OriginId,
    target: Weak<SourceHandle>,
}

impl StopSourceTask {
    pub(crate) fn new(query_id: QueryId, origin_id: OriginId, target: Weak<SourceHandle>) -> Self {
        Self {
            query_id,
            origin_id,
            target,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    /// Ask the source to stop, waiting at most `timeout` for in-flight reads.
    /// On success the handle leaves its plan, which releases the pipelines it
    /// feeds once the last reference to it is gone.
    pub fn attempt(&self, timeout: Duration) -> SourceStopAttempt {
        match self.target.upgrade() {
            Some(handle) => handle.attempt_unregister(timeout),
            None => {
                tracing::debug!(
                    "[{}] Source {} already destroyed, nothing to stop",
                    self.query_id,
                    self.origin_id
                );
                SourceStopAttempt::Expired
            }
        }
    }
}

impl fmt::Debug for StopSourceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSourceTask")
            .field("query_id", &self.query_id)
            .field("origin_id", &self.origin_id)
            .finish()
    }
}

/// Shuts a source down after it reported an error.
pub struct FailSourceTask {
    query_id: QueryId,
    origin_id: OriginId,
    target: Weak<SourceHandle>,
    error: EngineError,
}

impl FailSourceTask {
    pub(crate) fn new(
        query_id: QueryId,
        origin_id: OriginId,
        target: Weak<SourceHandle>,
        error: EngineError,
    ) -> Self {
        Self {
            query_id,
            origin_id,
            target,
            error,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    pub fn error(&self) -> &EngineError {
        &self.error
    }

    pub fn execute(self) -> TaskOutcome {
        match self.target.upgrade() {
            Some(handle) => {
                handle.fail(self.error);
                TaskOutcome::Failed
            }
            None => {
                tracing::debug!(
                    "[{}] Source {} already destroyed, dropping failure: {}",
                    self.query_id,
                    self.origin_id,
                    self.error
                );
                TaskOutcome::Expired
            }
        }
    }
}

impl fmt::Debug for FailSourceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailSourceTask")
            .field("query_id", &self.query_id)
            .field("origin_id", &self.origin_id)
            .field("error", &self.error.to_string())
            .finish()
    }
}
