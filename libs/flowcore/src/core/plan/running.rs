// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::core::completion::{CompletionToken, TokenPool};
use crate::core::delegates::{QueryLifetimeController, QueryLifetimeListener, WorkEmitter};
use crate::core::error::{ErrorHandler, Result};
use crate::core::ids::{OriginId, PipelineId, QueryId};
use crate::core::plan::node::NodeParts;
use crate::core::plan::source::{SourceParts, Unregister};
use crate::core::plan::{
    ExecutablePipeline, ExecutableQueryPlan, PipelineNode, SourceHandle, StoppingQueryPlan,
    TeardownPolicy,
};

/// Lifecycle of a running query plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanStatus {
    /// Setup tasks are still outstanding.
    #[default]
    Starting,
    /// Every pipeline is set up and every source opened.
    Running,
    /// `stop` was called; the graceful cascade is in progress.
    Stopping,
    /// `dispose` was called.
    Disposed,
    /// Dropped without `stop` or `dispose`.
    Dropped,
    /// Every node and source has been torn down.
    Destroyed,
}

type SharedSources = Arc<Mutex<HashMap<OriginId, Arc<SourceHandle>>>>;

/// The source handles of one started query.
///
/// Exactly one of [`stop`](Self::stop), [`dispose`](Self::dispose) or an
/// implicit drop tears the plan down:
///
/// | path    | stop hooks                  | `on_destruction` |
/// |---------|-----------------------------|------------------|
/// | stop    | termination tasks, cascaded | once             |
/// | dispose | inline, cascaded            | never            |
/// | drop    | inline, cascaded            | once             |
///
/// Pipelines that never finished setup are released without a stop hook on
/// every path.
pub struct RunningQueryPlan {
    query_id: QueryId,
    sources: SharedSources,
    status: Arc<Mutex<PlanStatus>>,
    policy: Arc<TeardownPolicy>,
    setup: Option<TokenPool>,
    expiration: Option<TokenPool>,
}

impl RunningQueryPlan {
    /// Validate `plan`, construct its pipeline nodes (successors first) and
    /// source handles, and submit one setup task per pipeline.
    ///
    /// Returns the plan plus a token of the setup pool. Once that token and
    /// every setup task are gone, the sources are opened and
    /// `listener.on_running()` fires, unless the plan was torn down first.
    pub fn start(
        plan: ExecutableQueryPlan,
        controller: Arc<dyn QueryLifetimeController>,
        emitter: Arc<dyn WorkEmitter>,
        listener: Arc<dyn QueryLifetimeListener>,
    ) -> Result<(RunningQueryPlan, CompletionToken)> {
        let order = plan.construction_order()?;
        let query_id = plan.query_id;
        tracing::info!(
            "[{}] Starting query plan ({} pipelines, {} sources)",
            query_id,
            plan.pipelines.len(),
            plan.sources.len()
        );

        let status = Arc::new(Mutex::new(PlanStatus::Starting));
        let policy = Arc::new(TeardownPolicy::default());
        let sources: SharedSources = Arc::new(Mutex::new(HashMap::new()));
        let on_error = failure_forwarder(query_id, &listener);

        let (expiration_pool, expiration_token) =
            TokenPool::create(format!("{}-expiration", query_id));
        expiration_pool.on_empty({
            let status = Arc::clone(&status);
            let listener = Arc::clone(&listener);
            move || {
                *status.lock() = PlanStatus::Destroyed;
                tracing::info!("[{}] Query plan destroyed", query_id);
                listener.on_destruction();
            }
        });
        let (setup_pool, setup_token) = TokenPool::create(format!("{}-setup", query_id));

        let mut pipelines: HashMap<PipelineId, ExecutablePipeline> =
            plan.pipelines.into_iter().map(|p| (p.id, p)).collect();
        let mut nodes: HashMap<PipelineId, Arc<PipelineNode>> = HashMap::with_capacity(order.len());
        for pipeline_id in order {
            let Some(pipeline) = pipelines.remove(&pipeline_id) else {
                continue;
            };
            let node = PipelineNode::build(
                NodeParts {
                    query_id,
                    pipeline_id,
                    emitter: Arc::clone(&emitter),
                    successors: resolve(&nodes, &pipeline.successors),
                    stage: pipeline.stage,
                    handlers: pipeline.operator_handlers,
                    on_error: Arc::clone(&on_error),
                    policy: Arc::clone(&policy),
                    expiration: expiration_token.clone(),
                },
                setup_token.clone(),
            );
            nodes.insert(pipeline_id, node);
        }

        for source in plan.sources {
            let handle = SourceHandle::new(SourceParts {
                query_id,
                origin_id: source.origin_id,
                source: source.source,
                successors: resolve(&nodes, &source.successors),
                emitter: Arc::clone(&emitter),
                controller: Arc::clone(&controller),
                listener: Arc::clone(&listener),
                on_error: Arc::clone(&on_error),
                unregister: unregister_from(&sources),
                expiration: expiration_token.clone(),
            });
            sources.lock().insert(source.origin_id, handle);
        }
        // From here on nodes are owned by their predecessors only.
        drop(nodes);

        setup_pool.on_empty({
            let sources = Arc::downgrade(&sources);
            let status = Arc::clone(&status);
            move || open_sources(query_id, &sources, &status, &*listener, &on_error)
        });

        Ok((
            RunningQueryPlan {
                query_id,
                sources,
                status,
                policy,
                setup: Some(setup_pool),
                expiration: Some(expiration_pool),
            },
            setup_token,
        ))
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn status(&self) -> PlanStatus {
        *self.status.lock()
    }

    /// Sources that have not been unregistered yet.
    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn source(&self, origin_id: OriginId) -> Option<Arc<SourceHandle>> {
        self.sources.lock().get(&origin_id).cloned()
    }

    /// Graceful stop. Every source is closed and released; each pipeline
    /// that completed setup then gets its own termination task, upstream
    /// first. `on_destruction` fires once the cascade has finished.
    pub fn stop(mut self) -> StoppingQueryPlan {
        tracing::info!("[{}] Stopping query plan", self.query_id);
        let expiration = self.begin_teardown(PlanStatus::Stopping, true, true);
        StoppingQueryPlan::new(self.query_id, expiration, Arc::clone(&self.status))
    }

    /// Hard stop without a destruction notification. Stop hooks run inline
    /// before this returns.
    pub fn dispose(mut self) {
        tracing::info!("[{}] Disposing query plan", self.query_id);
        // Disarmed already; dropping it is all that is left.
        drop(self.begin_teardown(PlanStatus::Disposed, false, false));
    }

    /// Shared by all three teardown paths. Returns the expiration pool, armed
    /// only if `notify` is set.
    fn begin_teardown(
        &mut self,
        next: PlanStatus,
        terminations: bool,
        notify: bool,
    ) -> Option<TokenPool> {
        {
            let mut status = self.status.lock();
            match *status {
                PlanStatus::Starting | PlanStatus::Running => *status = next,
                // Every source already ended on its own; nothing left to notify.
                PlanStatus::Destroyed => {}
                other => {
                    tracing::error!(
                        "[{}] Query plan torn down twice (already {:?})",
                        self.query_id,
                        other
                    );
                    debug_assert!(false, "query plan torn down twice");
                    return None;
                }
            }
        }

        if !terminations {
            self.policy.switch_to_hard();
        }
        if let Some(setup) = self.setup.take() {
            setup.disarm();
        }
        let expiration = self.expiration.take();
        if !notify {
            if let Some(pool) = &expiration {
                pool.disarm();
            }
        }

        let handles: Vec<Arc<SourceHandle>> =
            self.sources.lock().drain().map(|(_, handle)| handle).collect();
        tracing::debug!(
            "[{}] Releasing {} sources ({} teardown)",
            self.query_id,
            handles.len(),
            if terminations { "graceful" } else { "hard" }
        );
        drop(handles);
        expiration
    }
}

impl Drop for RunningQueryPlan {
    fn drop(&mut self) {
        if self.expiration.is_none() {
            return;
        }
        tracing::info!("[{}] Query plan dropped, hard stop", self.query_id);
        if let Some(pool) = self.begin_teardown(PlanStatus::Dropped, false, true) {
            pool.detach();
        }
    }
}

impl std::fmt::Debug for RunningQueryPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningQueryPlan")
            .field("query_id", &self.query_id)
            .field("status", &self.status())
            .field("sources", &self.source_count())
            .finish()
    }
}

fn resolve(nodes: &HashMap<PipelineId, Arc<PipelineNode>>, ids: &[PipelineId]) -> Vec<Arc<PipelineNode>> {
    ids.iter().filter_map(|id| nodes.get(id).cloned()).collect()
}

/// Forward the first failure of a plan to its listener; later ones are only
/// logged.
fn failure_forwarder(query_id: QueryId, listener: &Arc<dyn QueryLifetimeListener>) -> ErrorHandler {
    let listener = Arc::clone(listener);
    let reported = AtomicBool::new(false);
    Arc::new(move |error| {
        if reported.swap(true, Ordering::AcqRel) {
            tracing::warn!("[{}] Further failure after the first: {}", query_id, error);
            return;
        }
        tracing::error!("[{}] Query failed: {}", query_id, error);
        listener.on_failure(error);
    })
}

fn unregister_from(sources: &SharedSources) -> Unregister {
    let sources = Arc::downgrade(sources);
    Box::new(move |origin_id| {
        let Some(sources) = sources.upgrade() else {
            return;
        };
        let removed = sources.lock().remove(&origin_id);
        // Dropped outside the lock: this may tear down the fed pipelines.
        drop(removed);
    })
}

/// Runs when the setup pool collapses.
fn open_sources(
    query_id: QueryId,
    sources: &Weak<Mutex<HashMap<OriginId, Arc<SourceHandle>>>>,
    status: &Mutex<PlanStatus>,
    listener: &dyn QueryLifetimeListener,
    on_error: &ErrorHandler,
) {
    {
        let mut status = status.lock();
        if *status != PlanStatus::Starting {
            tracing::debug!(
                "[{}] Setup finished after teardown began ({:?})",
                query_id,
                *status
            );
            return;
        }
        *status = PlanStatus::Running;
    }

    let Some(sources) = sources.upgrade() else {
        return;
    };
    let origins: Vec<OriginId> = sources.lock().keys().copied().collect();
    let mut opened = true;
    for origin_id in origins {
        // Opened under the map lock: a concurrent teardown either drains the
        // source before it is opened or waits and closes it itself.
        let result = {
            let sources = sources.lock();
            let status = *status.lock();
            if status != PlanStatus::Running {
                tracing::debug!(
                    "[{}] Teardown began while opening sources ({:?})",
                    query_id,
                    status
                );
                return;
            }
            match sources.get(&origin_id) {
                Some(handle) => handle.open(),
                None => continue,
            }
        };
        if let Err(e) = result {
            opened = false;
            // May tear the plan down from inside the listener.
            on_error(e);
        }
    }

    if opened && *status.lock() == PlanStatus::Running {
        tracing::info!("[{}] Query plan running", query_id);
        listener.on_running();
    }
}
