// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Strongly typed numeric identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// First identifier handed out by a fresh counter.
            pub const INITIAL: Self = Self(1);

            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }

            /// The identifier following this one.
            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl Deref for $name {
            type Target = u64;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id!(
    /// Identifies one query across its whole lifetime in the engine.
    QueryId
);
numeric_id!(
    /// Identifies one pipeline stage within a query plan.
    PipelineId
);
numeric_id!(
    /// Identifies the data source a buffer originates from.
    OriginId
);
numeric_id!(
    /// Identity of the thread executing a task.
    WorkerThreadId
);
numeric_id!(TaskId);
numeric_id!(OperatorHandlerId);

impl WorkerThreadId {
    /// Thread draining the queues while the engine shuts down.
    pub const TERMINATOR: Self = Self(u64::MAX);

    /// Any thread that does not belong to the worker pool.
    pub const EXTERNAL: Self = Self(u64::MAX - 1);

    pub fn is_pool_worker(self) -> bool {
        self != Self::TERMINATOR && self != Self::EXTERNAL
    }
}
