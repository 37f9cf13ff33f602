// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::{AtomicBool, Ordering};

/// Plan-wide switch read by every node when its last reference drops.
///
/// Graceful: the retired node goes to a termination task.
/// Hard: the stop hook runs inline on the releasing thread.
#[derive(Debug, Default)]
pub(crate) struct TeardownPolicy {
    hard: AtomicBool,
}

impl TeardownPolicy {
    pub(crate) fn is_hard(&self) -> bool {
        self.hard.load(Ordering::Acquire)
    }

    pub(crate) fn switch_to_hard(&self) {
        self.hard.store(true, Ordering::Release);
    }
}
