// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::buffers::TupleBuffer;
use crate::core::completion::CompletionToken;
use crate::core::delegates::{
    QueryLifetimeController, QueryLifetimeListener, QueryTerminationType, WorkEmitter,
};
use crate::core::error::{EngineError, ErrorHandler, Result};
use crate::core::execution::ContinuationPolicy;
use crate::core::ids::{OriginId, QueryId};
use crate::core::plan::{PipelineNode, WorkTarget};
use crate::core::tasks::{FailSourceTask, SourceStopAttempt, StopSourceTask, WorkTask};

/// What a source reports through its emit function.
#[derive(Debug)]
pub enum SourceEvent {
    Data(TupleBuffer),
    EndOfStream,
    Error(EngineError),
}

/// Callback a started source uses to hand events to the engine. Safe to call
/// from any thread, including after the plan has been torn down.
pub type SourceEmitFn = Arc<dyn Fn(SourceEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStopOutcome {
    Stopped,
    /// Reads are still in flight.
    Pending,
}

/// A producer of input data, usually running its own thread.
///
/// `start` must not block on the events it emits; it is called while the
/// engine holds the source's lock.
pub trait DataSource: Send {
    fn start(&mut self, emit: SourceEmitFn) -> Result<()>;

    /// Stop if in-flight reads finish within `timeout`.
    fn try_stop(&mut self, _timeout: Duration) -> Result<SourceStopOutcome> {
        self.stop()?;
        Ok(SourceStopOutcome::Stopped)
    }

    /// Stop unconditionally.
    fn stop(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Constructed,
    Opened,
    Closed,
}

struct SourceSlot {
    source: Box<dyn DataSource>,
    state: SourceState,
}

pub(crate) type Unregister = Box<dyn Fn(OriginId) + Send + Sync>;

pub(crate) struct SourceParts {
    pub query_id: QueryId,
    pub origin_id: OriginId,
    pub source: Box<dyn DataSource>,
    pub successors: Vec<Arc<PipelineNode>>,
    pub emitter: Arc<dyn WorkEmitter>,
    pub controller: Arc<dyn QueryLifetimeController>,
    pub listener: Arc<dyn QueryLifetimeListener>,
    pub on_error: ErrorHandler,
    pub unregister: Unregister,
    pub expiration: CompletionToken,
}

/// Wraps one data source and strongly owns the pipelines it feeds.
///
/// The source is closed when the handle is destroyed, before the fed
/// pipelines are released.
pub struct SourceHandle {
    query_id: QueryId,
    origin_id: OriginId,
    slot: Mutex<SourceSlot>,
    successors: Vec<Arc<PipelineNode>>,
    emitter: Arc<dyn WorkEmitter>,
    controller: Arc<dyn QueryLifetimeController>,
    listener: Arc<dyn QueryLifetimeListener>,
    on_error: ErrorHandler,
    unregister: Unregister,
    stop_requested: Arc<AtomicBool>,
    _expiration: CompletionToken,
}

impl SourceHandle {
    pub(crate) fn new(parts: SourceParts) -> Arc<Self> {
        tracing::debug!(
            "[{}] Created source {} feeding {} pipelines",
            parts.query_id,
            parts.origin_id,
            parts.successors.len()
        );
        Arc::new(Self {
            query_id: parts.query_id,
            origin_id: parts.origin_id,
            slot: Mutex::new(SourceSlot {
                source: parts.source,
                state: SourceState::Constructed,
            }),
            successors: parts.successors,
            emitter: parts.emitter,
            controller: parts.controller,
            listener: parts.listener,
            on_error: parts.on_error,
            unregister: parts.unregister,
            stop_requested: Arc::new(AtomicBool::new(false)),
            _expiration: parts.expiration,
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    pub fn state(&self) -> SourceState {
        self.slot.lock().state
    }

    pub fn successors(&self) -> &[Arc<PipelineNode>] {
        &self.successors
    }

    /// Start the underlying source. Only the first call has an effect.
    pub(crate) fn open(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.state != SourceState::Constructed {
            tracing::debug!(
                "[{}] Source {} already {:?}, not opening",
                self.query_id,
                self.origin_id,
                slot.state
            );
            return Ok(());
        }
        slot.source.start(self.emit_fn())?;
        slot.state = SourceState::Opened;
        tracing::debug!("[{}] Source {} opened", self.query_id, self.origin_id);
        Ok(())
    }

    /// Emit function handed to the source. Holds only weak references so a
    /// source thread outliving its plan cannot keep anything alive.
    fn emit_fn(self: &Arc<Self>) -> SourceEmitFn {
        let query_id = self.query_id;
        let origin_id = self.origin_id;
        let handle = Arc::downgrade(self);
        let successors: Vec<WorkTarget> = self.successors.iter().map(|node| node.target()).collect();
        let emitter = Arc::clone(&self.emitter);
        let controller = Arc::clone(&self.controller);
        let stop_requested = Arc::clone(&self.stop_requested);
        let sequence = AtomicU64::new(0);

        Arc::new(move |event| match event {
            SourceEvent::Data(buffer) => {
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                let buffer = buffer.with_origin(origin_id, seq);
                for target in &successors {
                    let task = WorkTask::new(query_id, target.clone(), buffer.clone());
                    if !emitter.emit_work(task, ContinuationPolicy::Possible) {
                        tracing::warn!(
                            "[{}] Source {} buffer {} refused by pipeline {}",
                            query_id,
                            origin_id,
                            seq,
                            target.pipeline_id()
                        );
                    }
                }
            }
            SourceEvent::EndOfStream => {
                if stop_requested.swap(true, Ordering::AcqRel) {
                    tracing::debug!("[{}] Source {} repeated end-of-stream", query_id, origin_id);
                    return;
                }
                tracing::debug!("[{}] Source {} reached end-of-stream", query_id, origin_id);
                controller.initialize_source_stop(StopSourceTask::new(
                    query_id,
                    origin_id,
                    handle.clone(),
                ));
            }
            SourceEvent::Error(error) => {
                stop_requested.store(true, Ordering::Release);
                tracing::warn!("[{}] Source {} failed: {}", query_id, origin_id, error);
                controller.initialize_source_failure(FailSourceTask::new(
                    query_id,
                    origin_id,
                    handle.clone(),
                    error,
                ));
            }
        })
    }

    /// Stop the source after end-of-stream and leave the plan.
    pub(crate) fn attempt_unregister(&self, timeout: Duration) -> SourceStopAttempt {
        let stopped = {
            let mut slot = self.slot.lock();
            match slot.state {
                SourceState::Opened => match slot.source.try_stop(timeout) {
                    Ok(SourceStopOutcome::Pending) => {
                        tracing::warn!(
                            "[{}] Source {} still has reads in flight, retrying stop",
                            self.query_id,
                            self.origin_id
                        );
                        return SourceStopAttempt::Retry;
                    }
                    Ok(SourceStopOutcome::Stopped) => {
                        slot.state = SourceState::Closed;
                        Ok(())
                    }
                    Err(e) => {
                        slot.state = SourceState::Closed;
                        Err(e)
                    }
                },
                SourceState::Constructed | SourceState::Closed => Ok(()),
            }
        };

        match stopped {
            Ok(()) => {
                tracing::debug!("[{}] Source {} stopped", self.query_id, self.origin_id);
                self.listener
                    .on_source_termination(self.origin_id, QueryTerminationType::Graceful);
            }
            Err(e) => (self.on_error)(e),
        }
        (self.unregister)(self.origin_id);
        SourceStopAttempt::Stopped
    }

    /// Shut the source down after it reported `error`, then leave the plan.
    pub(crate) fn fail(&self, error: EngineError) {
        let stopped = {
            let mut slot = self.slot.lock();
            if slot.state == SourceState::Opened {
                slot.state = SourceState::Closed;
                slot.source.stop()
            } else {
                Ok(())
            }
        };
        if let Err(e) = stopped {
            tracing::warn!(
                "[{}] Failed to stop source {} after error: {}",
                self.query_id,
                self.origin_id,
                e
            );
        }

        self.listener
            .on_source_termination(self.origin_id, QueryTerminationType::Failure);
        (self.on_error)(error);
        (self.unregister)(self.origin_id);
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if slot.state == SourceState::Opened {
            slot.state = SourceState::Closed;
            if let Err(e) = slot.source.stop() {
                (self.on_error)(e);
            }
        }
        tracing::debug!("[{}] Source {} destroyed", self.query_id, self.origin_id);
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("query_id", &self.query_id)
            .field("origin_id", &self.origin_id)
            .field("state", &self.state())
            .field("successors", &self.successors.len())
            .finish()
    }
}
