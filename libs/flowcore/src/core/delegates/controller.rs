// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::tasks::{FailSourceTask, StopSourceTask};

/// Schedules source shutdown outside the source's own thread.
pub trait QueryLifetimeController: Send + Sync {
    /// A source reached end-of-stream. The controller keeps calling
    /// [`StopSourceTask::attempt`] until it no longer asks for a retry.
    fn initialize_source_stop(&self, task: StopSourceTask);

    /// A source reported an error.
    fn initialize_source_failure(&self, task: FailSourceTask);
}
