// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Pipeline stage failed: {0}")]
    Stage(String),

    #[error("Source failed: {0}")]
    Source(String),

    #[error("Invalid query plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Task queue full: {0}")]
    QueueFull(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Sink for failures raised inside asynchronous tasks. Ends at
/// [`QueryLifetimeListener::on_failure`](crate::core::delegates::QueryLifetimeListener::on_failure).
pub type ErrorHandler = Arc<dyn Fn(EngineError) + Send + Sync>;
