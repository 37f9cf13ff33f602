// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Compiled query plans as handed over by the query compiler.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::core::error::{EngineError, Result};
use crate::core::execution::{ExecutablePipelineStage, OperatorHandlers};
use crate::core::ids::{OriginId, PipelineId, QueryId};
use crate::core::plan::DataSource;

/// A compiled pipeline stage and the pipelines it emits to.
pub struct ExecutablePipeline {
    pub id: PipelineId,
    pub stage: Box<dyn ExecutablePipelineStage>,
    pub successors: Vec<PipelineId>,
    pub operator_handlers: OperatorHandlers,
}

impl ExecutablePipeline {
    pub fn new(
        id: PipelineId,
        stage: Box<dyn ExecutablePipelineStage>,
        successors: Vec<PipelineId>,
    ) -> Self {
        Self {
            id,
            stage,
            successors,
            operator_handlers: OperatorHandlers::default(),
        }
    }

    pub fn with_operator_handlers(mut self, handlers: OperatorHandlers) -> Self {
        self.operator_handlers = handlers;
        self
    }
}

impl fmt::Debug for ExecutablePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutablePipeline")
            .field("id", &self.id)
            .field("successors", &self.successors)
            .field("operator_handlers", &self.operator_handlers.len())
            .finish()
    }
}

/// A data source and the pipelines it feeds directly.
pub struct ExecutableSource {
    pub origin_id: OriginId,
    pub source: Box<dyn DataSource>,
    pub successors: Vec<PipelineId>,
}

impl ExecutableSource {
    pub fn new(origin_id: OriginId, source: Box<dyn DataSource>, successors: Vec<PipelineId>) -> Self {
        Self {
            origin_id,
            source,
            successors,
        }
    }
}

impl fmt::Debug for ExecutableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableSource")
            .field("origin_id", &self.origin_id)
            .field("successors", &self.successors)
            .finish()
    }
}

/// Sources feeding a DAG of pipelines, for one query.
#[derive(Debug)]
pub struct ExecutableQueryPlan {
    pub query_id: QueryId,
    pub pipelines: Vec<ExecutablePipeline>,
    pub sources: Vec<ExecutableSource>,
}

impl ExecutableQueryPlan {
    pub fn new(
        query_id: QueryId,
        pipelines: Vec<ExecutablePipeline>,
        sources: Vec<ExecutableSource>,
    ) -> Self {
        Self {
            query_id,
            pipelines,
            sources,
        }
    }

    /// Validate the plan and return the order in which its pipelines must be
    /// constructed: every pipeline after all of its successors.
    pub fn construction_order(&self) -> Result<Vec<PipelineId>> {
        let invalid = |msg: String| EngineError::InvalidPlan(format!("[{}] {}", self.query_id, msg));

        if self.sources.is_empty() {
            return Err(invalid("plan has no sources".into()));
        }

        let mut graph = DiGraph::<PipelineId, ()>::new();
        let mut index: HashMap<PipelineId, NodeIndex> = HashMap::new();
        for pipeline in &self.pipelines {
            if index.insert(pipeline.id, graph.add_node(pipeline.id)).is_some() {
                return Err(invalid(format!("duplicate pipeline {}", pipeline.id)));
            }
        }

        let resolve = |from: String, to: &PipelineId| {
            index
                .get(to)
                .copied()
                .ok_or_else(|| invalid(format!("{} references unknown pipeline {}", from, to)))
        };

        for pipeline in &self.pipelines {
            let from = index[&pipeline.id];
            for successor in &pipeline.successors {
                let to = resolve(format!("pipeline {}", pipeline.id), successor)?;
                graph.add_edge(from, to, ());
            }
        }

        let mut origins = HashSet::new();
        let mut reached = HashSet::new();
        for source in &self.sources {
            if !origins.insert(source.origin_id) {
                return Err(invalid(format!("duplicate source {}", source.origin_id)));
            }
            for successor in &source.successors {
                let start = resolve(format!("source {}", source.origin_id), successor)?;
                let mut dfs = Dfs::new(&graph, start);
                while let Some(node) = dfs.next(&graph) {
                    reached.insert(node);
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            invalid(format!(
                "pipeline {} is part of a cycle",
                graph[cycle.node_id()]
            ))
        })?;

        if let Some(orphan) = graph.node_indices().find(|node| !reached.contains(node)) {
            return Err(invalid(format!(
                "pipeline {} is not reachable from any source",
                graph[orphan]
            )));
        }

        Ok(sorted.into_iter().rev().map(|node| graph[node]).collect())
    }
}
