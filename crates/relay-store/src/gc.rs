//! Incremental mark-and-sweep collection.
//!
//! A collection cycle is split into bounded slices so it never blocks a
//! `lookup` or `publish` for long. Each slice spends a budget of record
//! visits, first marking from the retained roots and then sweeping. Any
//! write to the store between slices bumps the store's write epoch and
//! restarts the cycle from fresh roots, so a sweep never deletes a record
//! that became reachable after marking began.

use std::collections::HashSet;

use relay_core::{DataId, NormalizationSelector};

use crate::marker::ReferenceMarker;
use crate::source::RecordSource;

enum Phase {
    Idle,
    Marking(ReferenceMarker),
    Sweeping {
        marked: HashSet<DataId>,
        pending: Vec<DataId>,
        collected: usize,
    },
}

/// Progress reported by [`GarbageCollector::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcProgress {
    /// No cycle is running.
    Idle,
    /// The cycle needs more slices.
    Pending,
    /// The store was written since the cycle started; it must be restarted.
    Interrupted,
    /// The cycle finished, removing this many records.
    Finished { collected: usize },
}

/// State of one resumable collection cycle.
pub struct GarbageCollector {
    phase: Phase,
    started_at_epoch: u64,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        GarbageCollector {
            phase: Phase::Idle,
            started_at_epoch: 0,
        }
    }
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Begins a cycle marking from `roots`, discarding any cycle in flight.
    pub fn start<'a>(&mut self, roots: impl IntoIterator<Item = &'a NormalizationSelector>, epoch: u64) {
        let mut marker = ReferenceMarker::new();
        for root in roots {
            marker.add_root(root);
        }
        self.phase = Phase::Marking(marker);
        self.started_at_epoch = epoch;
    }

    pub fn cancel(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Spends up to `budget` record visits on the current cycle.
    pub fn step(&mut self, source: &mut RecordSource, epoch: u64, budget: usize) -> GcProgress {
        if !self.is_running() {
            return GcProgress::Idle;
        }
        if epoch != self.started_at_epoch {
            self.phase = Phase::Idle;
            return GcProgress::Interrupted;
        }
        let budget = budget.max(1);
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => GcProgress::Idle,
            Phase::Marking(mut marker) => {
                if marker.step(&*source, budget) {
                    let marked = marker.into_marked();
                    let pending = source.record_ids();
                    tracing::debug!(marked = marked.len(), candidates = pending.len(), "gc mark phase done");
                    self.phase = Phase::Sweeping {
                        marked,
                        pending,
                        collected: 0,
                    };
                } else {
                    self.phase = Phase::Marking(marker);
                }
                GcProgress::Pending
            }
            Phase::Sweeping {
                marked,
                mut pending,
                mut collected,
            } => {
                let start = pending.len().saturating_sub(budget);
                for id in pending.drain(start..) {
                    if !marked.contains(&id) {
                        source.remove(&id);
                        collected += 1;
                    }
                }
                if pending.is_empty() {
                    tracing::debug!(collected, "gc sweep done");
                    GcProgress::Finished { collected }
                } else {
                    self.phase = Phase::Sweeping {
                        marked,
                        pending,
                        collected,
                    };
                    GcProgress::Pending
                }
            }
        }
    }
}
