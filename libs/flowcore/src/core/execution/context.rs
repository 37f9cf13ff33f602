// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use bytes::BytesMut;
use std::sync::Arc;

use crate::core::buffers::TupleBuffer;
use crate::core::delegates::WorkEmitter;
use crate::core::execution::{ContinuationPolicy, OperatorHandler, OperatorHandlers, WorkerEnvironment};
use crate::core::ids::{OperatorHandlerId, PipelineId, QueryId, WorkerThreadId};
use crate::core::plan::{NodeCore, PipelineNode};
use crate::core::tasks::WorkTask;

/// Services available to a stage inside its start, execute and stop hooks.
pub trait PipelineExecutionContext {
    fn query_id(&self) -> QueryId;

    fn pipeline_id(&self) -> PipelineId;

    fn worker_thread_id(&self) -> WorkerThreadId;

    fn number_of_worker_threads(&self) -> usize;

    fn allocate_buffer(&self) -> BytesMut;

    fn operator_handler(&self, id: OperatorHandlerId) -> Option<Arc<dyn OperatorHandler>>;

    /// Hand a result buffer downstream. Returns `false` if any submission
    /// was refused or emission is not allowed in the current hook.
    fn emit_buffer(&self, buffer: TupleBuffer, policy: ContinuationPolicy) -> bool;
}

/// Where buffers emitted through a context end up.
pub(crate) enum Emission<'a> {
    /// Start hook. Emitting is a misuse.
    Rejected,
    /// Execute hook. Successors are targeted weakly; `Repeat` goes back to
    /// the node itself.
    Forward(&'a NodeCore),
    /// Graceful stop hook. Each task keeps its successor alive until the
    /// flushed buffer has been processed.
    Flush {
        successors: &'a [Arc<PipelineNode>],
        emitter: &'a dyn WorkEmitter,
    },
    /// Hard stop hook.
    Discard,
}

pub struct DefaultExecutionContext<'a> {
    env: &'a WorkerEnvironment,
    query_id: QueryId,
    pipeline_id: PipelineId,
    handlers: &'a OperatorHandlers,
    emission: Emission<'a>,
}

impl<'a> DefaultExecutionContext<'a> {
    pub(crate) fn new(
        env: &'a WorkerEnvironment,
        query_id: QueryId,
        pipeline_id: PipelineId,
        handlers: &'a OperatorHandlers,
        emission: Emission<'a>,
    ) -> Self {
        Self {
            env,
            query_id,
            pipeline_id,
            handlers,
            emission,
        }
    }

    fn forward(
        &self,
        successors: &[Arc<PipelineNode>],
        emitter: &dyn WorkEmitter,
        buffer: TupleBuffer,
        policy: ContinuationPolicy,
        keep_alive: bool,
    ) -> bool {
        let mut accepted = true;
        for successor in successors {
            let task = if keep_alive {
                WorkTask::keep_alive(self.query_id, Arc::clone(successor), buffer.clone())
            } else {
                WorkTask::new(self.query_id, successor.target(), buffer.clone())
            };
            accepted &= emitter.emit_work(task, policy);
        }
        accepted
    }
}

impl PipelineExecutionContext for DefaultExecutionContext<'_> {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    fn worker_thread_id(&self) -> WorkerThreadId {
        self.env.worker_thread_id
    }

    fn number_of_worker_threads(&self) -> usize {
        self.env.number_of_worker_threads
    }

    fn allocate_buffer(&self) -> BytesMut {
        self.env.buffer_provider.allocate()
    }

    fn operator_handler(&self, id: OperatorHandlerId) -> Option<Arc<dyn OperatorHandler>> {
        self.handlers.get(&id).cloned()
    }

    fn emit_buffer(&self, buffer: TupleBuffer, policy: ContinuationPolicy) -> bool {
        match &self.emission {
            Emission::Rejected => {
                tracing::error!(
                    "[{}-{}] Stage emitted a buffer during setup",
                    self.query_id,
                    self.pipeline_id
                );
                debug_assert!(false, "buffer emitted from a start hook");
                false
            }
            Emission::Forward(node) => {
                if policy == ContinuationPolicy::Repeat {
                    let task = WorkTask::new(self.query_id, node.target(), buffer);
                    return node.emitter().emit_work(task, policy);
                }
                self.forward(node.successors(), node.emitter(), buffer, policy, false)
            }
            Emission::Flush {
                successors,
                emitter,
            } => self.forward(successors, *emitter, buffer, policy, true),
            Emission::Discard => {
                tracing::warn!(
                    "[{}-{}] Dropping {} tuples emitted during hard stop",
                    self.query_id,
                    self.pipeline_id,
                    buffer.number_of_tuples()
                );
                false
            }
        }
    }
}
