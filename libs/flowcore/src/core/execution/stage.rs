// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::buffers::TupleBuffer;
use crate::core::error::Result;
use crate::core::execution::PipelineExecutionContext;

/// One compiled unit of per-tuple processing.
///
/// The engine guarantees:
/// - `start` is called at most once, by the setup task
/// - `stop` is called at most once, and only if `start` succeeded
/// - `stop` runs only after every predecessor's `stop` has returned
///
/// `execute` may run concurrently on several workers, so stages keep their
/// mutable state behind their own synchronization.
pub trait ExecutablePipelineStage: Send + Sync {
    fn start(&self, ctx: &dyn PipelineExecutionContext) -> Result<()>;

    fn execute(&self, buffer: &TupleBuffer, ctx: &dyn PipelineExecutionContext) -> Result<()>;

    /// Release resources. Buffers emitted here still reach the successors
    /// during a graceful stop and are dropped during a hard stop.
    fn stop(&self, ctx: &dyn PipelineExecutionContext) -> Result<()>;
}
