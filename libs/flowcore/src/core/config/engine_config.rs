// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Query engine configuration via `flowcore.yaml`.

use crate::core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Query engine configuration from `flowcore.yaml`. Every field is optional in
/// the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryEngineConfig {
    /// Worker threads executing pipeline and source tasks.
    pub number_of_worker_threads: usize,
    /// Capacity of the queue fed by worker threads.
    pub task_queue_size: usize,
    /// Capacity of the queue fed by threads outside the pool.
    pub admission_queue_size: usize,
    /// Size in bytes of buffers handed out by the default provider.
    pub buffer_size: usize,
    /// How long a source stop may wait for in-flight reads before retrying.
    pub source_stop_timeout_ms: u64,
    /// Upper bound on tasks a worker executes in place while its queue is full.
    pub max_in_place_recursion: usize,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            number_of_worker_threads: 4,
            task_queue_size: 1000,
            admission_queue_size: 1000,
            buffer_size: 8192,
            source_stop_timeout_ms: 10,
            max_in_place_recursion: 5000,
        }
    }
}

impl QueryEngineConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "flowcore.yaml";

    /// Load configuration from a directory. Returns error if the file is
    /// missing, cannot be parsed or holds invalid values.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            EngineError::Configuration(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;
        config.validate()?;

        tracing::info!("Loaded engine config from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a directory, returning defaults if the file is
    /// missing, unparseable or invalid.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("number_of_worker_threads", self.number_of_worker_threads),
            ("task_queue_size", self.task_queue_size),
            ("admission_queue_size", self.admission_queue_size),
            ("buffer_size", self.buffer_size),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(EngineError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn source_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.source_stop_timeout_ms)
    }
}
