// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::completion::TokenPool;
use crate::core::ids::QueryId;
use crate::core::plan::PlanStatus;

/// Handle to a plan whose graceful stop is in progress.
///
/// Dropping it never blocks and never cancels the cascade: the destruction
/// notification still fires once the last pipeline is gone. Use
/// [`dispose`](Self::dispose) to suppress it instead.
#[derive(Debug)]
pub struct StoppingQueryPlan {
    query_id: QueryId,
    expiration: Option<TokenPool>,
    status: Arc<Mutex<PlanStatus>>,
}

impl StoppingQueryPlan {
    pub(crate) fn new(
        query_id: QueryId,
        expiration: Option<TokenPool>,
        status: Arc<Mutex<PlanStatus>>,
    ) -> Self {
        Self {
            query_id,
            expiration,
            status,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn status(&self) -> PlanStatus {
        *self.status.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.status() == PlanStatus::Destroyed
    }

    /// Pipelines and sources not yet torn down.
    pub fn outstanding(&self) -> usize {
        self.expiration.as_ref().map_or(0, TokenPool::outstanding)
    }

    /// Let the cascade finish silently.
    pub fn dispose(mut self) {
        if let Some(pool) = self.expiration.take() {
            if pool.disarm() {
                tracing::debug!("[{}] Destruction notification suppressed", self.query_id);
            }
        }
    }
}

impl Drop for StoppingQueryPlan {
    fn drop(&mut self) {
        if let Some(pool) = self.expiration.take() {
            pool.detach();
        }
    }
}
