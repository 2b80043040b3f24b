//! # Batch Deduplicator
//!
//! A transient per-processing-batch set of keys already checked via
//! `ensure_ready`. Later events in the same batch resolving to a checked key
//! skip the call entirely. This is a throughput optimization layered on top
//! of the cache's own Ready fast path, not a substitute for it; the worker
//! owns one deduplicator and clears it at every batch boundary.

use std::collections::HashSet;

use crate::key::ResourceKey;

#[derive(Debug, Default)]
pub struct BatchDeduplicator {
    seen: HashSet<ResourceKey>,
}

impl BatchDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per key per batch: the caller runs `ensure_ready`
    /// only when this returns true.
    pub fn first_seen(&mut self, key: &ResourceKey) -> bool {
        self.seen.insert(key.clone())
    }

    /// Reset at the batch boundary.
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
