// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-task events reported by the worker pool.

use std::time::Instant;

use crate::core::ids::{PipelineId, QueryId, TaskId, WorkerThreadId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    QueryStart {
        thread: WorkerThreadId,
        query_id: QueryId,
        at: Instant,
    },
    QueryStop {
        thread: WorkerThreadId,
        query_id: QueryId,
        at: Instant,
    },
    PipelineStart {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        at: Instant,
    },
    PipelineStop {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        at: Instant,
    },
    TaskExecutionStart {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        task_id: TaskId,
        number_of_tuples: u64,
        at: Instant,
    },
    TaskExecutionComplete {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        task_id: TaskId,
        at: Instant,
    },
    TaskExpired {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        task_id: TaskId,
        at: Instant,
    },
    /// A work task was accepted by the pool.
    TaskEmit {
        thread: WorkerThreadId,
        query_id: QueryId,
        pipeline_id: PipelineId,
        task_id: TaskId,
        number_of_tuples: u64,
        at: Instant,
    },
}

impl EngineEvent {
    pub fn query_id(&self) -> QueryId {
        match self {
            EngineEvent::QueryStart { query_id, .. }
            | EngineEvent::QueryStop { query_id, .. }
            | EngineEvent::PipelineStart { query_id, .. }
            | EngineEvent::PipelineStop { query_id, .. }
            | EngineEvent::TaskExecutionStart { query_id, .. }
            | EngineEvent::TaskExecutionComplete { query_id, .. }
            | EngineEvent::TaskExpired { query_id, .. }
            | EngineEvent::TaskEmit { query_id, .. } => *query_id,
        }
    }
}

/// Receives [`EngineEvent`]s from worker threads. Must not block.
pub trait StatisticListener: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatisticListener;

impl StatisticListener for NoopStatisticListener {
    fn on_event(&self, _event: EngineEvent) {}
}

/// Writes every event to the `flowcore::statistics` tracing target at trace
/// level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatisticListener;

impl StatisticListener for TracingStatisticListener {
    fn on_event(&self, event: EngineEvent) {
        tracing::trace!(target: "flowcore::statistics", "[{}] {:?}", event.query_id(), event);
    }
}
