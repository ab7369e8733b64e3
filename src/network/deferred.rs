/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Single-assignment deferred value
//!
//! A [`Deferred`] starts pending and is resolved at most once. Waiters that
//! arrive after resolution are satisfied immediately; waiters that arrive
//! before are parked on a [`Notify`] and woken together when the value lands.
//! The DNS cache stores one per hostname and transfers use one as their
//! "go" gate.

use std::sync::OnceLock;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct Deferred<T> {
    value: OnceLock<T>,
    resolved: Notify,
}

impl<T: Clone> Deferred<T> {
    /// Create a pending deferred
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            resolved: Notify::new(),
        }
    }

    /// Create a deferred that is already resolved with `value`
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        let _ = deferred.value.set(value);
        deferred
    }

    /// Resolve the deferred and wake every waiter
    ///
    /// Returns `false` (and drops `value`) if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        self.resolved.notify_waiters();
        true
    }

    /// The resolved value, if any, without waiting
    pub fn peek(&self) -> Option<T> {
        self.value.get().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }

    /// Wait for the value
    ///
    /// Completes without suspending when the deferred is already resolved.
    pub async fn wait(&self) -> T {
        loop {
            // Register interest before checking so a concurrent resolve cannot slip between
            let notified = self.resolved.notified();
            if let Some(value) = self.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
