//! The deferred-call queue driving the pipeline.
//!
//! No lifecycle stage blocks and no notification runs under a foreign op
//! lock; every cross-op transition is enqueued as a [`RuntimeCall`] and
//! drained by the runtime's processing pump (or by worker threads — the
//! queue is lock-free).

use crossbeam_queue::SegQueue;
use smallvec::SmallVec;

use crate::types::OpKey;

/// One deferred lifecycle transition.
#[derive(Debug)]
pub(crate) enum RuntimeCall {
    /// Enter the mapping stage (the ready queue).
    TriggerMapping(OpKey),
    /// Continue a mapping that waited on children-mapped events or
    /// predicate resolution.
    ContinueMapping(OpKey),
    /// Enter the execution stage.
    TriggerExecution(OpKey),
    /// Execution finished externally; `poison` carries failure.
    DeferredComplete {
        /// The operation whose execution finished.
        op: OpKey,
        /// True if the execution event fired poisoned.
        poison: bool,
    },
    /// Enter the commit stage.
    TriggerCommit(OpKey),
    /// A producer finished mapping; decrement the consumer's count.
    NotifyMapped(OpKey),
    /// A producer resolved speculation; decrement the consumer's count.
    NotifySpeculated(OpKey),
    /// A consumer completed; decrement the producer's commit count.
    NotifyCommit(OpKey),
    /// A consumer verified some of the producer's regions.
    NotifyVerified(OpKey, SmallVec<[u32; 4]>),
    /// A predicate input resolved for a waiting operation.
    NotifyPredicate {
        /// The waiting operation.
        waiter: OpKey,
        /// Which input of the waiter resolved.
        input: u32,
        /// The resolved value.
        value: bool,
    },
    /// The last predicate reference on a predicate op was dropped.
    PredicateRefsReleased(OpKey),
    /// Abort the operation and propagate poison along out-edges.
    Quash {
        /// The operation to quash.
        op: OpKey,
        /// Re-raise the parent context when true.
        restart: bool,
    },
    /// A must-epoch child became ready to map.
    EpochChildReady(OpKey),
    /// Run the must-epoch trigger/map/distribute pipeline.
    EpochTrigger(OpKey),
    /// A must-epoch child completed.
    EpochSubopComplete(OpKey),
    /// A must-epoch child committed.
    EpochSubopCommit(OpKey),
}

/// Lock-free multi-producer multi-consumer call queue.
#[derive(Default)]
pub(crate) struct WorkQueue {
    calls: SegQueue<RuntimeCall>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&self, call: RuntimeCall) {
        self.calls.push(call);
    }

    #[inline]
    pub fn pop(&self) -> Option<RuntimeCall> {
        self.calls.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
