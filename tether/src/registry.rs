//! Transport registry: the process-wide set of known remote endpoints.
//!
//! Constructed explicitly by the hub and passed by reference; there is
//! no global singleton. All mutation happens under one lock, and the
//! lock is released before any caller-visible callback runs.

use std::sync::{Arc, Mutex};

use crate::transport::Transport;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    transports: Vec<Arc<Transport>>,
}

/// Lookup and lifecycle tracking for every registered transport.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    inner: Mutex<Inner>,
}

impl TransportRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hands out the next transport id, also used to synthesize serials
    /// for connections that arrive without one.
    pub(crate) fn reserve_id(&self) -> u64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.next_id
    }

    pub(crate) fn insert(&self, transport: Arc<Transport>) {
        self.lock().transports.push(transport);
    }

    /// Removes a transport by id. Returns it so the caller can run
    /// disconnect listeners outside the lock.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Transport>> {
        let mut inner = self.lock();
        let index = inner.transports.iter().position(|t| t.id() == id)?;
        Some(inner.transports.swap_remove(index))
    }

    /// Snapshot of every registered transport.
    pub fn list(&self) -> Vec<Arc<Transport>> {
        self.lock().transports.clone()
    }

    /// Finds the first transport matching a target spec (serial,
    /// devpath, metadata prefix, or address).
    pub fn find(&self, target: &str) -> Option<Arc<Transport>> {
        // Matching takes per-transport locks; run it on a snapshot so
        // the registry lock never nests inside them.
        self.list().into_iter().find(|t| t.matches_target(target))
    }

    /// Finds a transport by exact serial.
    pub fn by_serial(&self, serial: &str) -> Option<Arc<Transport>> {
        self.list().into_iter().find(|t| t.serial() == serial)
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.lock().transports.len()
    }

    /// True when no transport is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
