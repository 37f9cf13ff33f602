// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Reference engine around running query plans: a worker pool implementing
//! the task boundaries, a per-query catalog and a small facade.

mod catalog;
mod query_engine;
mod statistics;
mod status;
mod thread_pool;

pub use catalog::{QueryCatalog, QueryState, TerminationReason};
pub use query_engine::QueryEngine;
pub use statistics::{EngineEvent, NoopStatisticListener, StatisticListener, TracingStatisticListener};
pub use status::{QueryStatus, QueryStatusListener, TracingStatusListener};
pub use thread_pool::ThreadPool;
