// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Hosts call [`init_logging`] once at
//! startup; tests call [`init_test_logging`] as often as they like.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::core::{EngineError, Result};

/// Install a global subscriber. `RUST_LOG` overrides `default_directive`.
pub fn init_logging(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| {
            EngineError::Configuration(format!(
                "Invalid log directive '{}': {}",
                default_directive, e
            ))
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| EngineError::Runtime(format!("Failed to install subscriber: {}", e)))?;

    tracing::debug!("Logging initialized ({})", default_directive);
    Ok(())
}

/// Idempotent variant for tests. Output goes through the test writer so it is
/// captured per test.
pub fn init_test_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowcore=debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_thread_names(true))
        .try_init();
}
