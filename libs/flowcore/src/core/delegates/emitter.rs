// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::execution::ContinuationPolicy;
use crate::core::tasks::{StartPipelineTask, StopPipelineTask, WorkTask};

/// Work-submission boundary.
///
/// Implementations may run tasks on any thread. A submitted start or stop
/// task must eventually be executed or failed; dropping it unexecuted still
/// releases its completion token but skips the stage hook.
pub trait WorkEmitter: Send + Sync {
    /// Submit a buffer for processing. Returns whether the task was accepted.
    fn emit_work(&self, task: WorkTask, policy: ContinuationPolicy) -> bool;

    /// Submit the setup task of a freshly constructed pipeline node.
    fn emit_pipeline_start(&self, task: StartPipelineTask);

    /// Submit the termination task of a node whose last reference was dropped.
    fn emit_pipeline_stop(&self, task: StopPipelineTask);
}
