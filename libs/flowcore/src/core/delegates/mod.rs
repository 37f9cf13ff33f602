// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Seams between a running query plan and the rest of the engine.
//!
//! - [`WorkEmitter`]: where setup, termination and work tasks are submitted
//! - [`QueryLifetimeController`]: where source shutdown is scheduled
//! - [`QueryLifetimeListener`]: who hears about running, failure and destruction

mod controller;
mod emitter;
mod listener;

pub use controller::QueryLifetimeController;
pub use emitter::WorkEmitter;
pub use listener::{NoopLifetimeListener, QueryLifetimeListener, QueryTerminationType};
