//! Event aggregation: one pending delta per path.

use crate::event::ForwardedEvent;
use std::collections::HashMap;
use xorstor_common::{PendingDelta, TargetSlot};

/// A path together with everything reported about it this run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPath {
    pub path: Vec<u8>,
    pub delta: PendingDelta,
    /// Sum of the chunk sizes reported for the path.
    pub total_size: u64,
}

/// Merges repeated change events per path.
#[derive(Debug, Default)]
pub struct EventAggregator {
    entries: HashMap<Vec<u8>, (PendingDelta, u64)>,
}

impl EventAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event reported by the target in `source`.
    pub fn observe(&mut self, source: TargetSlot, event: &ForwardedEvent) {
        let (delta, size) = self.entries.entry(event.path.clone()).or_default();
        delta.observe(source, event.timestamp, event.kind);
        *size = size.saturating_add(event.chunk_size);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &[u8]) -> Option<&PendingDelta> {
        self.entries.get(path).map(|(delta, _)| delta)
    }

    /// Drain into a batch ordered by accumulated size, smallest first.
    /// Equal sizes are ordered by path so every run sees the same order.
    #[must_use]
    pub fn into_batch(self) -> Vec<PendingPath> {
        let mut batch: Vec<PendingPath> = self
            .entries
            .into_iter()
            .map(|(path, (delta, total_size))| PendingPath {
                path,
                delta,
                total_size,
            })
            .collect();
        batch.sort_by(|a, b| a.total_size.cmp(&b.total_size).then_with(|| a.path.cmp(&b.path)));
        batch
    }
}
