//! The operation node type: lifecycle state machine and dependence
//! bookkeeping.
//!
//! Every deferred unit of work occupies an operation slot for one
//! generation. The slot's state carries the per-generation fields of the
//! lifecycle: edge maps, outstanding-dependence counters, stage flags and
//! trigger guards. Lifecycle *driving* lives in [`crate::runtime`]; this
//! module owns the data model and the pure intra-op transitions.
//!
//! # Lifecycle
//!
//! initialize → dependence analysis → mapping → execution → completion →
//! commit. Each stage trigger runs at most once per generation, enforced
//! by the per-stage guard flags. `incoming` freezes at mapping; `outgoing`
//! freezes when the mapping-reference count drains; commit bumps the slot
//! generation and recycles the slot, at which point every outstanding
//! `(slot, gen)` reference to this generation is stale.

pub mod payload;

pub use payload::{
    AttachPayload, ClosePayload, CoherencePayload, CollectivePayload, CopyPayload, DeletionKind,
    DeletionPayload, DependentPartitionKind, DependentPartitionPayload, DetachPayload, FenceKind,
    FencePayload, FileMode, FillPayload, FillSource, FuturePredPayload, MapPayload, OpPayload,
    PartitionThunk, PendingPartitionPayload, PredComboPayload, PredInput, TaskPayload,
    TraceCapturePayload, TraceCompletePayload,
};

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::context::ContextInner;
use crate::event::{Event, UserEvent};
use crate::predicate::PredicateCell;
use crate::trace::Trace;
use crate::types::{DependenceType, FieldMask, GenerationId, OpKey, UniqueOpId};

/// The kind of an operation. Fixed per slot; slots are recycled through
/// per-kind freelists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    /// Inline mapping of a region into the parent task.
    Map,
    /// Explicit region-to-region copy.
    Copy,
    /// Mapping or execution fence.
    Fence,
    /// Frame marker bounding in-flight operations.
    Frame,
    /// Deferred deletion of a resource.
    Deletion,
    /// Runtime-internal close issued during traversal.
    InterClose,
    /// Runtime-internal close issued at context teardown.
    PostClose,
    /// User-level coherence acquire.
    Acquire,
    /// User-level coherence release.
    Release,
    /// Dynamic collective readout into a future.
    DynamicCollective,
    /// Predicate derived from a future.
    FuturePred,
    /// Predicate negation.
    NotPred,
    /// Predicate conjunction.
    AndPred,
    /// Predicate disjunction.
    OrPred,
    /// Must-parallel epoch meta-operation.
    MustEpoch,
    /// Deferred partition computation (metadata only).
    PendingPartition,
    /// Partition computed from region data.
    DependentPartition,
    /// Field fill.
    Fill,
    /// External file attach.
    Attach,
    /// External file detach.
    Detach,
    /// Sentinel ending a trace capture.
    TraceCapture,
    /// Fence ending a trace execution.
    TraceComplete,
    /// Task launch (collaborator boundary; used by must-epochs).
    Task,
}

impl OpKind {
    /// Number of operation kinds.
    pub const COUNT: usize = 23;

    /// Stable human-readable name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Map => "Mapping",
            Self::Copy => "Copy",
            Self::Fence => "Fence",
            Self::Frame => "Frame",
            Self::Deletion => "Deletion",
            Self::InterClose => "Inter Close",
            Self::PostClose => "Post Close",
            Self::Acquire => "Acquire",
            Self::Release => "Release",
            Self::DynamicCollective => "Dynamic Collective",
            Self::FuturePred => "Future Predicate",
            Self::NotPred => "Not Predicate",
            Self::AndPred => "And Predicate",
            Self::OrPred => "Or Predicate",
            Self::MustEpoch => "Must Epoch",
            Self::PendingPartition => "Pending Partition",
            Self::DependentPartition => "Dependent Partition",
            Self::Fill => "Fill",
            Self::Attach => "Attach",
            Self::Detach => "Detach",
            Self::TraceCapture => "Trace Capture",
            Self::TraceComplete => "Trace Complete",
            Self::Task => "Task",
        }
    }

    /// Dense index for per-kind tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns true if operations of this kind attach to a predicate and
    /// follow the speculation protocol.
    #[must_use]
    pub const fn is_speculative(self) -> bool {
        matches!(
            self,
            Self::Copy | Self::Acquire | Self::Release | Self::Fill | Self::Task
        )
    }

    /// Returns true if this kind is a runtime-internal close.
    #[must_use]
    pub const fn is_close(self) -> bool {
        matches!(self, Self::InterClose | Self::PostClose)
    }

    /// Returns true if this kind owns a predicate cell.
    #[must_use]
    pub const fn is_predicate(self) -> bool {
        matches!(
            self,
            Self::FuturePred | Self::NotPred | Self::AndPred | Self::OrPred
        )
    }
}

/// Result of a stage-trigger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The stage ran to completion synchronously.
    Proceed,
    /// The stage enqueued deferred work and will continue on an event.
    Deferred,
    /// The `(slot, gen)` reference was stale; nothing happened.
    Stale,
    /// The operation is poisoned; the stage propagated the poison.
    Poisoned,
}

/// Result of an edge-registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The edge was added on both endpoints.
    Registered,
    /// The target committed under the matching generation; no edge.
    AlreadyCommitted,
    /// The target generation no longer matches; no edge.
    Stale,
    /// Both endpoints belong to the same must-epoch; the dependence was
    /// recorded on the epoch instead of the graph.
    EpochInterposed,
}

impl RegistrationOutcome {
    /// Returns true if an edge was added to the graph.
    #[must_use]
    pub const fn edge_added(self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// Speculation protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecState {
    /// Waiting to decide; predicate unresolved and not yet speculated.
    PendingMap,
    /// Mapped optimistically assuming the predicate is true.
    SpeculateTrue,
    /// Skipped mapping assuming the predicate is false.
    SpeculateFalse,
    /// Predicate resolved true.
    ResolveTrue,
    /// Predicate resolved false.
    ResolveFalse,
}

/// Speculation bookkeeping for a predicated operation.
#[derive(Debug)]
pub(crate) struct SpecInfo {
    /// Current protocol state.
    pub state: SpecState,
    /// The predicate this operation is gated on.
    pub predicate: Arc<PredicateCell>,
}

/// Membership of an op in a must-parallel epoch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MustEpochLink {
    /// The epoch meta-operation.
    pub epoch: OpKey,
    /// Index of this op among the epoch's single tasks.
    pub index: u32,
}

/// One dependence recorded during the logical traversal; consulted when
/// the op is captured in a trace.
#[derive(Debug, Clone, Copy)]
pub struct LogicalRecord {
    /// The producer the traversal registered on.
    pub target: OpKey,
    /// Consumer requirement index, or -1 for a plain edge.
    pub source_req: i32,
    /// Producer requirement index, or -1 for a plain edge.
    pub target_req: i32,
    /// The derived dependence kind.
    pub dtype: DependenceType,
    /// Whether the consumer validates the producer's region.
    pub validates: bool,
    /// Fields the dependence covers.
    pub mask: FieldMask,
}

/// Per-generation state of an operation slot.
pub(crate) struct OpState {
    /// Generation these fields belong to.
    pub gen: GenerationId,
    /// Globally unique id, assigned at initialize.
    pub unique_op_id: UniqueOpId,
    /// Enclosing context (weak back-reference).
    pub parent: Weak<ContextInner>,
    /// Producers: slot → generation. Grows only until `mapped`.
    pub incoming: BTreeMap<u32, GenerationId>,
    /// Consumers: slot → generation. Grows only until the mapping
    /// reference count drains.
    pub outgoing: BTreeMap<u32, GenerationId>,
    /// Unresolved producer count gating mapping.
    pub outstanding_mapping_deps: u32,
    /// Unresolved producer count gating speculation.
    pub outstanding_speculation_deps: u32,
    /// Unfinished consumer/verification count gating commit.
    pub outstanding_commit_deps: u32,
    /// External holders that may still add edges onto this op.
    pub outstanding_mapping_references: u32,
    /// Own requirement indices not yet verified by a consumer.
    pub unverified_regions: BTreeSet<u32>,
    /// Producer slot → that producer's requirement indices this op will
    /// verify when it completes.
    pub verify_regions: BTreeMap<u32, BTreeSet<u32>>,
    /// Children-mapped events of producers; gate mapping.
    pub dependent_children_mapped: Vec<Event>,
    /// Children-mapped event this op provides, if it tracks children.
    pub children_mapped: Option<UserEvent>,
    /// Completion event; fires exactly once per generation.
    pub completion_event: UserEvent,
    /// Set when mapping finished; freezes `incoming`.
    pub mapped: bool,
    /// Set when execution finished.
    pub executed: bool,
    /// Set when speculation resolved.
    pub resolved: bool,
    /// Set when outputs were hardened; with all regions verified this
    /// allows commit before the commit-dependence count drains.
    pub hardened: bool,
    /// Set when the operation completed.
    pub completed: bool,
    /// Set when the operation committed.
    pub committed: bool,
    /// Set when the operation was quashed.
    pub quashed: bool,
    /// Set when completion carries the poison marker.
    pub poisoned: bool,
    /// Allows commit without waiting for consumer verification.
    pub early_commit_request: bool,
    /// Whether this op still owes the completion-event trigger.
    pub need_completion_trigger: bool,
    /// Whether the parent context tracks this operation.
    pub track_parent: bool,
    /// Whether this op is being captured in a trace.
    pub tracing: bool,
    /// The trace this op participates in, if any.
    pub trace: Option<Arc<Trace>>,
    /// Must-epoch membership, if any.
    pub must_epoch: Option<MustEpochLink>,
    /// Dependences recorded during the logical traversal; consulted when
    /// this op is captured in a trace.
    pub logical_records: Vec<LogicalRecord>,
    /// Guard: dependence analysis entered.
    pub analysis_begun: bool,
    /// Guard: trigger-mapping ran.
    pub mapping_invoked: bool,
    /// Guard: trigger-resolution ran.
    pub resolution_invoked: bool,
    /// Guard: trigger-complete ran.
    pub complete_invoked: bool,
    /// Guard: trigger-commit ran.
    pub commit_invoked: bool,
    /// Dedup flag for ready-queue insertion.
    pub mapping_enqueued: bool,
    /// Dedup flag for commit-queue insertion.
    pub commit_enqueued: bool,
    /// Speculation protocol state for predicated ops.
    pub speculation: Option<SpecInfo>,
    /// Kind-specific payload.
    pub payload: OpPayload,
}

impl OpState {
    fn inactive(gen: GenerationId) -> Self {
        Self {
            gen,
            unique_op_id: 0,
            parent: Weak::new(),
            incoming: BTreeMap::new(),
            outgoing: BTreeMap::new(),
            outstanding_mapping_deps: 0,
            outstanding_speculation_deps: 0,
            outstanding_commit_deps: 0,
            outstanding_mapping_references: 0,
            unverified_regions: BTreeSet::new(),
            verify_regions: BTreeMap::new(),
            dependent_children_mapped: Vec::new(),
            children_mapped: None,
            completion_event: UserEvent::new(),
            mapped: false,
            executed: false,
            resolved: false,
            hardened: false,
            completed: false,
            committed: false,
            quashed: false,
            poisoned: false,
            early_commit_request: false,
            need_completion_trigger: false,
            track_parent: false,
            tracing: false,
            trace: None,
            must_epoch: None,
            logical_records: Vec::new(),
            analysis_begun: false,
            mapping_invoked: false,
            resolution_invoked: false,
            complete_invoked: false,
            commit_invoked: false,
            mapping_enqueued: false,
            commit_enqueued: false,
            speculation: None,
            payload: OpPayload::Inactive,
        }
    }

    /// Returns true if mapping may be triggered now.
    pub fn mapping_ready(&self) -> bool {
        self.analysis_begun
            && self.outstanding_mapping_deps == 0
            && self.outstanding_speculation_deps == 0
            && !self.mapped
            && !self.mapping_invoked
            && !self.quashed
    }

    /// Returns true if commit may be triggered now.
    pub fn commit_ready(&self) -> bool {
        self.completed
            && !self.commit_invoked
            && self.outstanding_mapping_references == 0
            && (self.outstanding_commit_deps == 0
                || self.early_commit_request
                || (self.hardened && self.unverified_regions.is_empty()))
    }

    /// Returns true if all three execution-side flags are set and the
    /// completion trigger has not run.
    pub fn completion_ready(&self) -> bool {
        self.mapped && self.executed && self.resolved && !self.complete_invoked
    }

    /// Resets the state for slot recycling, producing the next
    /// generation's inactive state.
    pub fn reset_for_reuse(&mut self, next_gen: GenerationId) {
        *self = Self::inactive(next_gen);
    }
}

/// A reusable operation slot.
///
/// `gen` and `unique_id` shadow fields of the locked state so that stale
/// checks and lock ordering never require the state lock of a foreign op.
pub(crate) struct OpSlot {
    /// Index of this slot in the table.
    pub slot: u32,
    /// Kind of every generation hosted by this slot.
    pub kind: OpKind,
    /// Current generation.
    pub gen: AtomicU32,
    /// Unique id of the current generation (0 while inactive).
    pub unique_id: AtomicU64,
    /// The per-generation state.
    pub state: Mutex<OpState>,
}

impl OpSlot {
    /// Creates a fresh slot at generation 0.
    pub fn new(slot: u32, kind: OpKind) -> Arc<Self> {
        Arc::new(Self {
            slot,
            kind,
            gen: AtomicU32::new(0),
            unique_id: AtomicU64::new(0),
            state: Mutex::new(OpState::inactive(0)),
        })
    }

    /// The key naming the current generation.
    pub fn current_key(&self) -> OpKey {
        OpKey::new(self.slot, self.gen.load(Ordering::Acquire))
    }

    /// Unique id of the current generation, for lock ordering.
    pub fn current_unique_id(&self) -> UniqueOpId {
        self.unique_id.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for OpSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "OpSlot({} {:?} gen={})",
            self.kind.name(),
            self.slot,
            self.gen.load(Ordering::Relaxed)
        )
    }
}
