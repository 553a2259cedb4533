//! Per-server access coordination
//!
//! Network sources share one [`AccessCoordinator`] so that requests to the same
//! server address are spaced by at least the configured delay. Reserving a slot
//! and recording it happen under one lock, so two concurrent callers can never
//! both be told that they may go immediately.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Time of the last granted access per server address
#[derive(Debug, Default)]
pub struct AccessCoordinator {
    last_access: Mutex<HashMap<String, Instant>>,
}

impl AccessCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next access slot for `server` and return how long the caller
    /// has to wait before using it
    pub fn reserve(&self, server: &str, min_delay: Duration) -> Duration {
        let now = Instant::now();
        let mut last_access = self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = match last_access.get(server) {
            Some(previous) => (*previous + min_delay).max(now),
            None => now,
        };
        last_access.insert(server.to_string(), slot);
        slot.saturating_duration_since(now)
    }

    /// Reserve a slot and sleep until it is reached. Returns the time waited.
    pub fn wait_turn(&self, server: &str, min_delay: Duration) -> Duration {
        let wait = self.reserve(server, min_delay);
        if !wait.is_zero() {
            tracing::debug!("Waiting {:?} before contacting {}", wait, server);
            std::thread::sleep(wait);
        }
        wait
    }

    /// Time of the most recently reserved slot for `server`
    pub fn last_access(&self, server: &str) -> Option<Instant> {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .copied()
    }

    /// Drop the history of `server`
    pub fn forget(&self, server: &str) {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server);
    }
}
