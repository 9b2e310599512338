//! Memoized dependence traces.
//!
//! A trace records, for a sequence of operations issued under it, which
//! edges the dependence analyzer derived. Two modes:
//!
//! - *capturing*: append-only; every registered operation and every
//!   successful region registration is recorded.
//! - *fixed*: read-only; replay rounds re-issue the same operation
//!   sequence and the saved edge sets are replayed verbatim instead of
//!   re-running the analyzer.
//!
//! Recorded references are positional (index into the trace), so each
//! replay round rebinds indices to that round's freshly initialized
//! operations. A replay that cannot rebind an index (the sequence
//! diverged) falls back to full analysis for the affected operation.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::tracing_compat::{debug, trace};
use crate::types::{DependenceType, OpKey, TraceId};

/// One memoized dependence edge, positional within the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TraceDependence {
    /// Index of the producer within the trace.
    pub producer: usize,
    /// Producer requirement index, or -1 for a plain (non-region) edge.
    pub target_req: i32,
    /// Consumer requirement index, or -1 for a plain edge.
    pub source_req: i32,
    /// The dependence kind that was derived.
    pub dtype: DependenceType,
    /// Whether the consumer validates the producer's region.
    pub validates: bool,
}

#[derive(Default)]
struct TraceInner {
    fixed: bool,
    /// Operations of the current round, positional. Capture appends;
    /// replay rebinds index by index.
    operations: Vec<Option<OpKey>>,
    /// Reverse lookup for recording dependences during capture.
    op_map: HashMap<OpKey, usize>,
    /// Parallel to `operations`: the memoized edge set per op.
    dependences: Vec<BTreeSet<TraceDependence>>,
    /// Next index to rebind during a replay round.
    replay_cursor: usize,
}

/// A memoized sequence of operations and their inter-edges.
pub struct Trace {
    tid: TraceId,
    inner: Mutex<TraceInner>,
}

impl Trace {
    /// Creates an empty trace in capturing mode.
    #[must_use]
    pub fn new(tid: TraceId) -> Self {
        Self {
            tid,
            inner: Mutex::new(TraceInner::default()),
        }
    }

    /// The trace id.
    #[must_use]
    pub fn tid(&self) -> TraceId {
        self.tid
    }

    /// Returns true once the capture has been frozen.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.inner.lock().fixed
    }

    /// Number of operations captured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    /// Returns true if no operation has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().operations.is_empty()
    }

    /// Records an operation during capture; returns its trace index.
    ///
    /// # Panics
    /// Panics if the trace is already fixed.
    pub fn record_operation(&self, op: OpKey) -> usize {
        let mut inner = self.inner.lock();
        assert!(!inner.fixed, "capture append on fixed trace");
        let index = inner.operations.len();
        inner.operations.push(Some(op));
        inner.op_map.insert(op, index);
        inner.dependences.push(BTreeSet::new());
        trace!(tid = ?self.tid, index, "trace captured operation");
        index
    }

    /// Records a derived edge during capture. A no-op on fixed traces and
    /// for producers outside the trace (edges to pre-trace operations are
    /// covered by the trace-complete fence on replay).
    pub fn record_dependence(
        &self,
        source: OpKey,
        target: OpKey,
        source_req: i32,
        target_req: i32,
        dtype: DependenceType,
        validates: bool,
    ) {
        let mut inner = self.inner.lock();
        if inner.fixed {
            return;
        }
        let (Some(&source_idx), Some(&producer)) =
            (inner.op_map.get(&source), inner.op_map.get(&target))
        else {
            return;
        };
        inner.dependences[source_idx].insert(TraceDependence {
            producer,
            target_req,
            source_req,
            dtype,
            validates,
        });
    }

    /// Freezes the capture: the dependence sets become read-only and
    /// subsequent rounds replay them.
    pub fn fix(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.fixed, "trace fixed twice");
        inner.fixed = true;
        debug!(tid = ?self.tid, ops = inner.operations.len(), "trace fixed");
    }

    /// Begins a replay round: prior round bindings are dropped and the
    /// cursor resets to the first position.
    pub fn start_replay_round(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.fixed, "replay round on capturing trace");
        for slot in &mut inner.operations {
            *slot = None;
        }
        inner.op_map.clear();
        inner.replay_cursor = 0;
    }

    /// Rebinds the next trace position to `op` for this replay round.
    /// Returns the position, or `None` if the issued sequence is longer
    /// than the capture (the caller falls back to full analysis).
    pub fn replay_operation(&self, op: OpKey) -> Option<usize> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.fixed, "replay on capturing trace");
        let index = inner.replay_cursor;
        if index >= inner.operations.len() {
            return None;
        }
        inner.operations[index] = Some(op);
        inner.op_map.insert(op, index);
        inner.replay_cursor = index + 1;
        Some(index)
    }

    /// The memoized edges of the op at `index`.
    #[must_use]
    pub fn dependences_for(&self, index: usize) -> Vec<TraceDependence> {
        self.inner
            .lock()
            .dependences
            .get(index)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The current round's operation bound at `index`.
    #[must_use]
    pub fn op_at(&self, index: usize) -> Option<OpKey> {
        self.inner.lock().operations.get(index).copied().flatten()
    }

    /// Keys of every operation bound this round, in trace order.
    #[must_use]
    pub fn current_operations(&self) -> Vec<OpKey> {
        self.inner
            .lock()
            .operations
            .iter()
            .copied()
            .flatten()
            .collect()
    }
}

impl core::fmt::Debug for Trace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "Trace({:?}, fixed={}, ops={})",
            self.tid,
            inner.fixed,
            inner.operations.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(slot: u32, gen: u32) -> OpKey {
        OpKey::new(slot, gen)
    }

    #[test]
    fn capture_records_in_order() {
        let trace = Trace::new(TraceId(1));
        assert_eq!(trace.record_operation(key(0, 0)), 0);
        assert_eq!(trace.record_operation(key(1, 0)), 1);
        assert_eq!(trace.len(), 2);
        assert!(!trace.is_fixed());
    }

    #[test]
    fn dependences_record_only_intra_trace_edges() {
        let trace = Trace::new(TraceId(1));
        trace.record_operation(key(0, 0));
        trace.record_operation(key(1, 0));
        // Producer outside the trace: silently skipped.
        trace.record_dependence(key(1, 0), key(9, 0), 0, 0, DependenceType::True, false);
        assert!(trace.dependences_for(1).is_empty());

        trace.record_dependence(key(1, 0), key(0, 0), 0, 0, DependenceType::True, true);
        let deps = trace.dependences_for(1);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].producer, 0);
        assert!(deps[0].validates);
    }

    #[test]
    fn record_dependence_is_noop_when_fixed() {
        let trace = Trace::new(TraceId(1));
        trace.record_operation(key(0, 0));
        trace.record_operation(key(1, 0));
        trace.fix();
        trace.record_dependence(key(1, 0), key(0, 0), 0, 0, DependenceType::True, false);
        assert!(trace.dependences_for(1).is_empty());
    }

    #[test]
    fn replay_rebinds_positions() {
        let trace = Trace::new(TraceId(1));
        trace.record_operation(key(0, 0));
        trace.record_operation(key(1, 0));
        trace.record_dependence(key(1, 0), key(0, 0), 0, 0, DependenceType::Output, false);
        trace.fix();

        trace.start_replay_round();
        assert_eq!(trace.replay_operation(key(0, 1)), Some(0));
        assert_eq!(trace.replay_operation(key(1, 1)), Some(1));
        // The saved edge now resolves to the round's new producer.
        let deps = trace.dependences_for(1);
        assert_eq!(trace.op_at(deps[0].producer), Some(key(0, 1)));
        // A third op exceeds the captured sequence.
        assert_eq!(trace.replay_operation(key(2, 0)), None);
    }

    #[test]
    #[should_panic(expected = "capture append on fixed trace")]
    fn capture_after_fix_panics() {
        let trace = Trace::new(TraceId(1));
        trace.fix();
        trace.record_operation(key(0, 0));
    }
}
