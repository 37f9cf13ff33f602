// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Engine configuration.

mod engine_config;

pub use engine_config::QueryEngineConfig;
