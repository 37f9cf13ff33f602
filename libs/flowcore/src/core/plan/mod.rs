// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The running query plan.
//!
//! A [`RunningQueryPlan`] owns the [`SourceHandle`]s of one query. Each source
//! handle strongly owns the [`PipelineNode`]s it feeds, and each node owns its
//! successors, so a node stays alive exactly as long as some predecessor may
//! still send it data. When the last reference to a node goes away the node is
//! retired: its stop hook runs (in a termination task, or inline during a hard
//! stop) and only then are its successors released, one hop at a time.

mod graph;
mod node;
mod running;
mod source;
mod stopping;
mod teardown;

pub use graph::{ExecutablePipeline, ExecutableQueryPlan, ExecutableSource};
pub use node::{PipelineNode, RetiredNode, WorkTarget};
pub(crate) use node::{NodeCore, PendingWork};
pub use running::{PlanStatus, RunningQueryPlan};
pub use source::{DataSource, SourceEmitFn, SourceEvent, SourceHandle, SourceState, SourceStopOutcome};
pub use stopping::StoppingQueryPlan;

pub(crate) use teardown::TeardownPolicy;
