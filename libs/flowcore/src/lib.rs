// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

#![allow(clippy::too_many_arguments)] // Node construction mirrors the plan wiring it receives

//! flowcore: lifecycle engine for running stream-processing query plans.
//!
//! A compiled query arrives as an [`ExecutableQueryPlan`](crate::core::plan::ExecutableQueryPlan).
//! [`RunningQueryPlan::start`](crate::core::plan::RunningQueryPlan::start) turns it into a
//! reference-counted graph of pipeline nodes and source handles, drives asynchronous
//! setup, and tears everything down in cascade order when input ends or the query is
//! cancelled. [`QueryEngine`](crate::core::engine::QueryEngine) bundles the plan lifecycle with
//! a worker pool and a per-query catalog.

pub mod core;

pub use crate::core::*;
