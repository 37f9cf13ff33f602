// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use crate::core::buffers::{BufferProvider, HeapBufferProvider};
use crate::core::config::QueryEngineConfig;
use crate::core::engine::catalog::{QueryCatalog, QueryState};
use crate::core::engine::statistics::StatisticListener;
use crate::core::engine::status::QueryStatusListener;
use crate::core::engine::thread_pool::{EngineTask, ThreadPool};
use crate::core::error::Result;
use crate::core::ids::QueryId;
use crate::core::plan::ExecutableQueryPlan;

/// Worker pool plus query catalog.
///
/// Starting and stopping queries is asynchronous: both calls only enqueue a
/// task. Progress is reported through the [`QueryStatusListener`].
pub struct QueryEngine {
    pool: ThreadPool,
    catalog: Arc<QueryCatalog>,
}

impl QueryEngine {
    /// Engine whose workers allocate heap buffers of `config.buffer_size`.
    pub fn new(
        config: QueryEngineConfig,
        statistics: Arc<dyn StatisticListener>,
        status: Arc<dyn QueryStatusListener>,
    ) -> Result<Self> {
        let buffers = Arc::new(HeapBufferProvider::new(config.buffer_size));
        Self::with_buffer_provider(config, statistics, status, buffers)
    }

    pub fn with_buffer_provider(
        config: QueryEngineConfig,
        statistics: Arc<dyn StatisticListener>,
        status: Arc<dyn QueryStatusListener>,
        buffers: Arc<dyn BufferProvider>,
    ) -> Result<Self> {
        let pool = ThreadPool::new(&config, statistics, buffers)?;
        Ok(Self {
            pool,
            catalog: Arc::new(QueryCatalog::new(status)),
        })
    }

    pub fn start(&self, plan: ExecutableQueryPlan) {
        let query_id = plan.query_id;
        tracing::info!("[{}] Submitting query", query_id);
        self.pool.submit(EngineTask::StartQuery {
            query_id,
            plan,
            catalog: Arc::downgrade(&self.catalog),
        });
    }

    pub fn stop(&self, query_id: QueryId) {
        tracing::info!("[{}] Requesting stop", query_id);
        self.pool.submit(EngineTask::StopQuery {
            query_id,
            catalog: Arc::downgrade(&self.catalog),
        });
    }

    pub fn query_state(&self, query_id: QueryId) -> Option<QueryState> {
        self.catalog.state(query_id)
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        tracing::info!("Shutting down query engine");
        self.pool.as_terminator(|| self.catalog.clear());
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("pool", &self.pool)
            .field("catalog", &self.catalog)
            .finish()
    }
}
