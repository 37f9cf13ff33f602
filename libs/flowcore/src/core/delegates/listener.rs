// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::error::EngineError;
use crate::core::ids::OriginId;

/// How a source or query came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTerminationType {
    Graceful,
    Failure,
}

/// Observer of one running query plan.
///
/// `on_running`, `on_failure` and `on_destruction` are each invoked at most
/// once per plan, on arbitrary threads, possibly while the plan is tearing
/// itself down. Implementations must not block and must not tear the plan
/// down while holding a lock they also take inside these callbacks.
pub trait QueryLifetimeListener: Send + Sync {
    /// Every pipeline finished setup and every source was opened.
    fn on_running(&self);

    /// A stage hook or a source failed.
    fn on_failure(&self, error: EngineError);

    /// Every node and source has been torn down.
    fn on_destruction(&self);

    /// A single source finished, before the rest of the plan necessarily has.
    fn on_source_termination(&self, _origin_id: OriginId, _termination: QueryTerminationType) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifetimeListener;

impl QueryLifetimeListener for NoopLifetimeListener {
    fn on_running(&self) {}

    fn on_failure(&self, _error: EngineError) {}

    fn on_destruction(&self) {}
}
