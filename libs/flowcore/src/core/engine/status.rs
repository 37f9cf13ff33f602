// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::SystemTime;

use crate::core::delegates::QueryTerminationType;
use crate::core::error::EngineError;
use crate::core::ids::{OriginId, QueryId};

/// Externally visible query status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Accepted by the catalog; pipelines are being set up.
    Started,
    Running,
    Stopped,
    Failed,
}

/// Receives status changes for every query in a [`QueryEngine`](super::QueryEngine).
pub trait QueryStatusListener: Send + Sync {
    fn log_query_status_change(&self, query_id: QueryId, status: QueryStatus, at: SystemTime);

    fn log_query_failure(&self, query_id: QueryId, error: &EngineError, at: SystemTime);

    fn log_source_termination(
        &self,
        query_id: QueryId,
        origin_id: OriginId,
        termination: QueryTerminationType,
        at: SystemTime,
    );
}

/// Status listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusListener;

impl QueryStatusListener for TracingStatusListener {
    fn log_query_status_change(&self, query_id: QueryId, status: QueryStatus, _at: SystemTime) {
        tracing::info!("[{}] Query status: {:?}", query_id, status);
    }

    fn log_query_failure(&self, query_id: QueryId, error: &EngineError, _at: SystemTime) {
        tracing::error!("[{}] Query failed: {}", query_id, error);
    }

    fn log_source_termination(
        &self,
        query_id: QueryId,
        origin_id: OriginId,
        termination: QueryTerminationType,
        _at: SystemTime,
    ) {
        tracing::debug!(
            "[{}] Source {} terminated ({:?})",
            query_id,
            origin_id,
            termination
        );
    }
}
