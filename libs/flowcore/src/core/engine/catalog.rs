// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-query lifecycle bookkeeping.
//!
//! Plan listeners fire synchronously inside plan teardown, so a plan is never
//! stopped or disposed while its state cell is locked: the plan is moved out,
//! the lock released, and only then is the plan torn down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::core::delegates::{
    QueryLifetimeController, QueryLifetimeListener, QueryTerminationType, WorkEmitter,
};
use crate::core::engine::status::{QueryStatus, QueryStatusListener};
use crate::core::error::{EngineError, Result};
use crate::core::ids::{OriginId, QueryId};
use crate::core::plan::{ExecutableQueryPlan, RunningQueryPlan, StoppingQueryPlan};

/// Why a query reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Stopped,
    Failed,
}

/// Snapshot of a query's state in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Reserved,
    Starting,
    Running,
    Stopping,
    Terminated(TerminationReason),
}

enum StateCell {
    Reserved,
    Starting(RunningQueryPlan),
    Running(RunningQueryPlan),
    /// `None` while the plan is being stopped outside the lock.
    Stopping(Option<StoppingQueryPlan>),
    Terminated(TerminationReason),
}

impl StateCell {
    fn snapshot(&self) -> QueryState {
        match self {
            StateCell::Reserved => QueryState::Reserved,
            StateCell::Starting(_) => QueryState::Starting,
            StateCell::Running(_) => QueryState::Running,
            StateCell::Stopping(_) => QueryState::Stopping,
            StateCell::Terminated(reason) => QueryState::Terminated(*reason),
        }
    }

    /// Tear down whatever plan the cell held.
    fn dispose(self) {
        match self {
            StateCell::Starting(plan) | StateCell::Running(plan) => plan.dispose(),
            StateCell::Stopping(Some(stopping)) => stopping.dispose(),
            StateCell::Reserved | StateCell::Stopping(None) | StateCell::Terminated(_) => {}
        }
    }
}

type SharedCell = Arc<Mutex<StateCell>>;

/// Tracks every query started through a [`QueryEngine`](super::QueryEngine).
pub struct QueryCatalog {
    queries: Mutex<HashMap<QueryId, SharedCell>>,
    status: Arc<dyn QueryStatusListener>,
}

impl QueryCatalog {
    pub fn new(status: Arc<dyn QueryStatusListener>) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            status,
        }
    }

    pub fn state(&self, query_id: QueryId) -> Option<QueryState> {
        let cell = self.queries.lock().get(&query_id).cloned()?;
        let state = cell.lock().snapshot();
        Some(state)
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `query_id` and start its plan.
    pub fn start(
        &self,
        query_id: QueryId,
        plan: ExecutableQueryPlan,
        controller: Arc<dyn QueryLifetimeController>,
        emitter: Arc<dyn WorkEmitter>,
    ) -> Result<()> {
        let cell: SharedCell = Arc::new(Mutex::new(StateCell::Reserved));
        {
            let mut queries = self.queries.lock();
            if queries.contains_key(&query_id) {
                return Err(EngineError::Runtime(format!(
                    "query {} is already registered",
                    query_id
                )));
            }
            queries.insert(query_id, Arc::clone(&cell));
        }
        self.status
            .log_query_status_change(query_id, QueryStatus::Started, SystemTime::now());

        let listener = Arc::new(CatalogListener {
            query_id,
            cell: Arc::downgrade(&cell),
            status: Arc::clone(&self.status),
        });

        let (plan, setup) = match RunningQueryPlan::start(plan, controller, emitter, listener) {
            Ok(started) => started,
            Err(e) => {
                self.status
                    .log_query_failure(query_id, &e, SystemTime::now());
                *cell.lock() = StateCell::Terminated(TerminationReason::Failed);
                return Err(e);
            }
        };

        let rejected = {
            let mut state = cell.lock();
            if matches!(*state, StateCell::Reserved) {
                *state = StateCell::Starting(plan);
                None
            } else {
                Some(plan)
            }
        };
        if let Some(plan) = rejected {
            tracing::debug!("[{}] Query terminated while starting, disposing", query_id);
            plan.dispose();
        }

        // May fire on_running right here; the cell lock is not held.
        drop(setup);
        Ok(())
    }

    /// Gracefully stop a starting or running query.
    pub fn stop(&self, query_id: QueryId) -> Result<()> {
        let cell = self
            .queries
            .lock()
            .get(&query_id)
            .cloned()
            .ok_or_else(|| EngineError::Runtime(format!("unknown query {}", query_id)))?;

        let plan = {
            let mut state = cell.lock();
            match mem::replace(&mut *state, StateCell::Stopping(None)) {
                StateCell::Starting(plan) | StateCell::Running(plan) => plan,
                other => {
                    let snapshot = other.snapshot();
                    *state = other;
                    tracing::debug!("[{}] Not stopping query in state {:?}", query_id, snapshot);
                    return Ok(());
                }
            }
        };

        let stopping = plan.stop();

        let finished = {
            let mut state = cell.lock();
            if matches!(*state, StateCell::Stopping(None)) {
                *state = StateCell::Stopping(Some(stopping));
                None
            } else {
                Some(stopping)
            }
        };
        // Destruction already happened during stop; the handle is spent.
        drop(finished);
        Ok(())
    }

    /// Dispose every query. Used when the engine shuts down.
    pub fn clear(&self) {
        let cells: Vec<(QueryId, SharedCell)> = self.queries.lock().drain().collect();
        tracing::debug!("Clearing {} queries", cells.len());
        for (query_id, cell) in cells {
            let held = mem::replace(
                &mut *cell.lock(),
                StateCell::Terminated(TerminationReason::Stopped),
            );
            if !matches!(held, StateCell::Terminated(_)) {
                tracing::debug!("[{}] Disposing query on shutdown", query_id);
            }
            held.dispose();
        }
    }
}

impl std::fmt::Debug for QueryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCatalog")
            .field("queries", &self.len())
            .finish()
    }
}

/// Drives the state cell of one query from its plan's lifetime events.
struct CatalogListener {
    query_id: QueryId,
    cell: Weak<Mutex<StateCell>>,
    status: Arc<dyn QueryStatusListener>,
}

impl CatalogListener {
    /// Move the cell to `next` if `accept` allows the current state, and hand
    /// back the plan it held.
    fn transition(&self, accept: fn(&StateCell) -> bool, next: StateCell) -> Option<StateCell> {
        let cell = self.cell.upgrade()?;
        let mut state = cell.lock();
        if !accept(&state) {
            return None;
        }
        Some(mem::replace(&mut *state, next))
    }
}

impl QueryLifetimeListener for CatalogListener {
    fn on_running(&self) {
        let Some(cell) = self.cell.upgrade() else {
            return;
        };
        let promoted = {
            let mut state = cell.lock();
            match mem::replace(&mut *state, StateCell::Reserved) {
                StateCell::Starting(plan) => {
                    *state = StateCell::Running(plan);
                    true
                }
                other => {
                    *state = other;
                    false
                }
            }
        };
        if promoted {
            self.status
                .log_query_status_change(self.query_id, QueryStatus::Running, SystemTime::now());
        }
    }

    fn on_failure(&self, error: EngineError) {
        let held = self.transition(
            |state| !matches!(state, StateCell::Terminated(_)),
            StateCell::Terminated(TerminationReason::Failed),
        );
        self.status
            .log_query_failure(self.query_id, &error, SystemTime::now());
        if let Some(held) = held {
            self.status
                .log_query_status_change(self.query_id, QueryStatus::Failed, SystemTime::now());
            held.dispose();
        }
    }

    fn on_destruction(&self) {
        let held = self.transition(
            |state| {
                matches!(
                    state,
                    StateCell::Starting(_) | StateCell::Running(_) | StateCell::Stopping(_)
                )
            },
            StateCell::Terminated(TerminationReason::Stopped),
        );
        if let Some(held) = held {
            self.status
                .log_query_status_change(self.query_id, QueryStatus::Stopped, SystemTime::now());
            held.dispose();
        }
    }

    fn on_source_termination(&self, origin_id: OriginId, termination: QueryTerminationType) {
        self.status.log_source_termination(
            self.query_id,
            origin_id,
            termination,
            SystemTime::now(),
        );
    }
}
