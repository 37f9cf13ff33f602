// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! What a pipeline stage sees while it runs.

mod context;
mod stage;

pub use context::{DefaultExecutionContext, PipelineExecutionContext};
pub(crate) use context::Emission;
pub use stage::ExecutablePipelineStage;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::buffers::{BufferProvider, HeapBufferProvider};
use crate::core::ids::{OperatorHandlerId, WorkerThreadId};

/// How eagerly an emitted buffer must be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuationPolicy {
    /// The buffer may be processed in place if the queue is full.
    #[default]
    Possible,
    /// Re-run the emitting pipeline on the buffer instead of its successors.
    Repeat,
    /// Never process in place; the submission may be refused.
    Never,
}

/// Operator state shared between invocations of a pipeline stage, such as a
/// join hash table or window slices.
pub trait OperatorHandler: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

pub type OperatorHandlers = Arc<HashMap<OperatorHandlerId, Arc<dyn OperatorHandler>>>;

/// Per-thread environment handed to every task by whoever executes it.
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub worker_thread_id: WorkerThreadId,
    pub number_of_worker_threads: usize,
    pub buffer_provider: Arc<dyn BufferProvider>,
}

impl WorkerEnvironment {
    pub fn new(
        worker_thread_id: WorkerThreadId,
        number_of_worker_threads: usize,
        buffer_provider: Arc<dyn BufferProvider>,
    ) -> Self {
        Self {
            worker_thread_id,
            number_of_worker_threads,
            buffer_provider,
        }
    }

    /// Environment for stop hooks run inline by a hard stop, on whatever
    /// thread released the last reference.
    pub fn teardown() -> Self {
        Self::new(
            WorkerThreadId::EXTERNAL,
            1,
            Arc::new(HeapBufferProvider::default()),
        )
    }
}

impl std::fmt::Debug for WorkerEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEnvironment")
            .field("worker_thread_id", &self.worker_thread_id)
            .field("number_of_worker_threads", &self.number_of_worker_threads)
            .field("buffer_size", &self.buffer_provider.buffer_size())
            .finish()
    }
}
