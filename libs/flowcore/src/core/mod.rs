// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod buffers;
pub mod completion;
pub mod config;
pub mod delegates;
pub mod engine;
pub mod error;
pub mod execution;
pub mod ids;
pub mod logging;
pub mod plan;
pub mod tasks;

pub use buffers::*;
pub use completion::{CompletionToken, TokenPool};
pub use config::QueryEngineConfig;
pub use delegates::*;
pub use engine::*;
pub use error::*;
pub use execution::*;
pub use ids::*;
pub use plan::*;
pub use tasks::*;
