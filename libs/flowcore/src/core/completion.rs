// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fire-once-when-all-done aggregation.
//!
//! A [`TokenPool`] hands out one [`CompletionToken`]. Cloning a token raises
//! the shared counter, dropping one lowers it, and the first time the counter
//! reaches zero the closure registered with [`TokenPool::on_empty`] runs on
//! whichever thread dropped the last token. Closures must be cheap and must
//! not touch the pool that is firing them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type OnEmpty = Box<dyn FnOnce() + Send>;

struct PoolState {
    name: String,
    outstanding: AtomicUsize,
    fired: AtomicBool,
    on_empty: Mutex<Option<OnEmpty>>,
}

impl PoolState {
    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::trace!("[{}] token pool collapsed", self.name);
            self.fire();
        }
    }

    fn fire(&self) {
        // Taken under the lock so exactly one caller ever gets the closure.
        let callback = self.on_empty.lock().take();
        if let Some(callback) = callback {
            self.fired.store(true, Ordering::Release);
            callback();
        }
    }
}

/// Owner side of a token pool.
///
/// The handle itself is not counted. Dropping it (or calling
/// [`disarm`](Self::disarm)) removes the closure so it never runs;
/// [`detach`](Self::detach) gives the handle up while leaving the closure armed.
pub struct TokenPool {
    state: Arc<PoolState>,
    disarm_on_drop: bool,
}

impl TokenPool {
    /// Create a pool and its first token.
    pub fn create(name: impl Into<String>) -> (TokenPool, CompletionToken) {
        let state = Arc::new(PoolState {
            name: name.into(),
            outstanding: AtomicUsize::new(1),
            fired: AtomicBool::new(false),
            on_empty: Mutex::new(None),
        });
        let token = CompletionToken {
            state: Arc::clone(&state),
        };
        (
            TokenPool {
                state,
                disarm_on_drop: true,
            },
            token,
        )
    }

    /// Register the closure run when the last token is dropped. Runs it right
    /// away if every token is already gone. Replaces any earlier closure that
    /// has not fired yet.
    pub fn on_empty<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.state.on_empty.lock() = Some(Box::new(callback));
        if self.state.outstanding.load(Ordering::Acquire) == 0 {
            self.state.fire();
        }
    }

    /// Remove the closure without running it. Returns whether one was armed.
    pub fn disarm(&self) -> bool {
        let removed = self.state.on_empty.lock().take().is_some();
        if removed {
            tracing::trace!("[{}] token pool disarmed", self.state.name);
        }
        removed
    }

    /// Give up the handle but keep the closure armed.
    pub fn detach(mut self) {
        self.disarm_on_drop = false;
    }

    /// Tokens still alive.
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }
}

impl Drop for TokenPool {
    fn drop(&mut self) {
        if self.disarm_on_drop {
            self.disarm();
        }
    }
}

impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("name", &self.state.name)
            .field("outstanding", &self.outstanding())
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// One counted share of a [`TokenPool`].
pub struct CompletionToken {
    state: Arc<PoolState>,
}

impl CompletionToken {
    pub fn pool_name(&self) -> &str {
        &self.state.name
    }
}

impl Clone for CompletionToken {
    fn clone(&self) -> Self {
        self.state.outstanding.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.state.release();
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionToken")
            .field(&self.state.name)
            .finish()
    }
}
