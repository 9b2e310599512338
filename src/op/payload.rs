//! Kind-specific operation payloads.
//!
//! The base lifecycle is shared; what differs per kind is the data each
//! variant carries through it. [`OpPayload`] is the tagged union the
//! dispatch tables in [`crate::runtime`] specialize on.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::{DynamicCollective, Event, Future, UserEvent};
use crate::launcher::PhysicalRegion;
use crate::mapper::Placement;
use crate::must_epoch::MustEpochPayload;
use crate::predicate::PredicateCell;
use crate::trace::Trace;
use crate::types::{
    DomainPoint, FieldId, FieldMask, FieldSpace, IndexPartition, IndexSpace, LogicalRegion,
    OpKey, RegionRequirement, RegionTreeId,
};

/// Fence flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Orders mapping of later operations after earlier ones.
    Mapping,
    /// Additionally orders execution: the fence completes only after every
    /// prior operation in the context has completed.
    Execution,
    /// Execution ordering with mapping-fence semantics for later ops.
    Mixed,
}

/// What a deletion operation deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionKind {
    /// An index space.
    IndexSpace(IndexSpace),
    /// An index partition.
    IndexPartition(IndexPartition),
    /// A whole field space.
    FieldSpace(FieldSpace),
    /// A set of fields within a field space.
    Fields(FieldSpace, FieldMask),
    /// A logical region.
    LogicalRegion(LogicalRegion),
    /// A logical partition of a region tree.
    LogicalPartition(RegionTreeId, IndexPartition),
}

impl DeletionKind {
    /// The region tree whose users must drain before the deletion commits,
    /// if the deletion names one.
    #[must_use]
    pub fn region_tree(&self) -> Option<RegionTreeId> {
        match self {
            Self::LogicalRegion(region) => Some(region.tree),
            Self::LogicalPartition(tree, _) => Some(*tree),
            _ => None,
        }
    }
}

/// Access mode of an attached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Existing file, read-only.
    ReadOnly,
    /// Existing file, read-write.
    ReadWrite,
    /// Create or truncate.
    Create,
}

/// Thunk variants for deferred partition computation.
#[derive(Debug, Clone)]
pub enum PartitionThunk {
    /// Partition into pieces of near-equal volume.
    Equal {
        /// Partition being computed.
        partition: IndexPartition,
        /// Minimum piece granularity.
        granularity: u64,
    },
    /// Partition weighted per color point.
    Weighted {
        /// Partition being computed.
        partition: IndexPartition,
        /// Minimum piece granularity.
        granularity: u64,
        /// Per-point weights.
        weights: BTreeMap<DomainPoint, i32>,
    },
    /// Pointwise union of two partitions.
    Union {
        /// Partition being computed.
        partition: IndexPartition,
        /// Left operand.
        handle1: IndexPartition,
        /// Right operand.
        handle2: IndexPartition,
    },
    /// Pointwise intersection of two partitions.
    Intersection {
        /// Partition being computed.
        partition: IndexPartition,
        /// Left operand.
        handle1: IndexPartition,
        /// Right operand.
        handle2: IndexPartition,
    },
    /// Pointwise difference of two partitions.
    Difference {
        /// Partition being computed.
        partition: IndexPartition,
        /// Left operand.
        handle1: IndexPartition,
        /// Right operand.
        handle2: IndexPartition,
    },
    /// Cross product against every piece of a source partition.
    CrossProduct {
        /// Base partition.
        base: IndexPartition,
        /// Source partition.
        source: IndexPartition,
    },
    /// Union or intersection of index spaces into a pending space.
    ComputePendingSpace {
        /// The pending space being computed.
        target: IndexSpace,
        /// Union when true, intersection when false.
        is_union: bool,
        /// Explicit operand spaces; empty when `handle` is used.
        spaces: Vec<IndexSpace>,
        /// Operate over all pieces of this partition instead.
        handle: Option<IndexPartition>,
    },
    /// Difference of an initial space and a set of spaces.
    ComputePendingDifference {
        /// The pending space being computed.
        target: IndexSpace,
        /// Initial space.
        initial: IndexSpace,
        /// Spaces subtracted from the initial space.
        spaces: Vec<IndexSpace>,
    },
}

/// Kinds of data-dependent partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentPartitionKind {
    /// Partition by a color field of the region itself.
    ByField,
    /// Partition by the image of a pointer field through a projection.
    ByImage,
    /// Partition by the preimage of a pointer field.
    ByPreimage,
}

/// Payload of an inline mapping operation.
#[derive(Debug)]
pub struct MapPayload {
    /// The single region requirement.
    pub requirement: RegionRequirement,
    /// The physical region handle returned to the application.
    pub region: PhysicalRegion,
    /// Placement chosen by the mapper.
    pub placement: Option<Placement>,
}

/// Payload of a copy operation.
#[derive(Debug)]
pub struct CopyPayload {
    /// Source requirements.
    pub src_requirements: SmallVec<[RegionRequirement; 2]>,
    /// Destination requirements, pairwise with the sources.
    pub dst_requirements: SmallVec<[RegionRequirement; 2]>,
    /// Placements chosen by the mapper, sources then destinations.
    pub placements: Vec<Placement>,
}

/// Payload of a fence operation.
#[derive(Debug)]
pub struct FencePayload {
    /// Which ordering the fence enforces.
    pub kind: FenceKind,
    /// Completion events of the operations the fence waits on; gathered
    /// during dependence analysis for execution fences.
    pub previous: Vec<Event>,
}

/// Payload of a deletion operation.
#[derive(Debug)]
pub struct DeletionPayload {
    /// What is being deleted.
    pub kind: DeletionKind,
}

/// Payload of a close operation (inter or post).
#[derive(Debug)]
pub struct ClosePayload {
    /// The localized requirement being closed.
    pub requirement: RegionRequirement,
    /// The op whose traversal caused this close; excluded from edge
    /// registration to avoid self-dependence. `None` for post closes.
    pub create_op: Option<OpKey>,
}

/// Payload of an acquire or release operation.
#[derive(Debug)]
pub struct CoherencePayload {
    /// The single region requirement.
    pub requirement: RegionRequirement,
}

/// Payload of a dynamic-collective readout.
#[derive(Debug)]
pub struct CollectivePayload {
    /// The collective being read.
    pub collective: DynamicCollective,
    /// Future receiving the collective's value.
    pub future: Future,
}

/// Payload of a future-predicate operation.
#[derive(Debug)]
pub struct FuturePredPayload {
    /// The future supplying the predicate value.
    pub future: Future,
    /// The predicate cell this op owns and resolves.
    pub cell: Arc<PredicateCell>,
}

/// One input of a predicate combinator.
#[derive(Debug)]
pub struct PredInput {
    /// The input predicate cell.
    pub cell: Arc<PredicateCell>,
    /// The observed value, once delivered.
    pub value: Option<bool>,
}

/// Payload of a predicate combinator (NOT, AND, OR).
#[derive(Debug)]
pub struct PredComboPayload {
    /// The predicate cell this combinator owns and resolves.
    pub cell: Arc<PredicateCell>,
    /// Input cells; one for NOT, two for AND/OR.
    pub inputs: SmallVec<[PredInput; 2]>,
}

/// Payload of a pending-partition operation.
#[derive(Debug)]
pub struct PendingPartitionPayload {
    /// The deferred computation.
    pub thunk: PartitionThunk,
    /// Fires when the computed handle is usable.
    pub handle_ready: UserEvent,
}

/// Payload of a dependent-partition operation.
#[derive(Debug)]
pub struct DependentPartitionPayload {
    /// Which data-dependent partitioning to perform.
    pub kind: DependentPartitionKind,
    /// The region requirement reading the data field.
    pub requirement: RegionRequirement,
    /// The partition being computed.
    pub partition: IndexPartition,
    /// Projection partition for image/preimage computations.
    pub projection: Option<IndexPartition>,
    /// Fires when the computed handle is usable.
    pub handle_ready: UserEvent,
}

/// Source of a fill value.
#[derive(Debug, Clone)]
pub enum FillSource {
    /// Immediate bytes supplied at launch.
    Bytes(Arc<[u8]>),
    /// Value produced by a future.
    Future(Future),
}

/// Payload of a fill operation.
#[derive(Debug)]
pub struct FillPayload {
    /// The single region requirement (write-discard).
    pub requirement: RegionRequirement,
    /// Where the fill value comes from.
    pub source: FillSource,
}

/// Payload of an attach operation.
#[derive(Debug)]
pub struct AttachPayload {
    /// The single region requirement (exclusive coherence).
    pub requirement: RegionRequirement,
    /// Path of the external file.
    pub file_name: String,
    /// Field id → name of the field in the external file.
    pub field_map: BTreeMap<FieldId, String>,
    /// Access mode.
    pub mode: FileMode,
    /// The physical region handle returned to the application.
    pub region: PhysicalRegion,
}

/// Payload of a detach operation.
#[derive(Debug)]
pub struct DetachPayload {
    /// The single region requirement covering the attached fields.
    pub requirement: RegionRequirement,
    /// The region being detached.
    pub region: PhysicalRegion,
}

/// Payload of the sentinel ending a trace capture.
#[derive(Debug)]
pub struct TraceCapturePayload {
    /// The trace being fixed.
    pub trace: Arc<Trace>,
}

/// Payload of the fence ending a trace execution.
#[derive(Debug)]
pub struct TraceCompletePayload {
    /// The trace whose members the fence covers.
    pub trace: Arc<Trace>,
    /// Completion events of the trace members this round.
    pub previous: Vec<Event>,
}

/// Payload of a task launch; the task body itself is a collaborator
/// boundary, so the payload carries only what the graph core needs.
#[derive(Debug)]
pub struct TaskPayload {
    /// Region requirements of the task.
    pub requirements: SmallVec<[RegionRequirement; 2]>,
    /// The point this task occupies in its launch domain.
    pub point: DomainPoint,
    /// Future receiving the task's result.
    pub future: Future,
    /// Placement chosen by the mapper.
    pub placement: Option<Placement>,
}

/// The tagged union of per-kind payloads.
#[derive(Debug)]
pub enum OpPayload {
    /// Slot is between generations.
    Inactive,
    /// Inline mapping.
    Map(MapPayload),
    /// Copy.
    Copy(CopyPayload),
    /// Fence or frame (frames reuse the fence payload with execution
    /// semantics).
    Fence(FencePayload),
    /// Deletion.
    Deletion(DeletionPayload),
    /// Inter or post close.
    Close(ClosePayload),
    /// Acquire or release.
    Coherence(CoherencePayload),
    /// Dynamic-collective readout.
    Collective(CollectivePayload),
    /// Future predicate.
    FuturePred(FuturePredPayload),
    /// Predicate combinator.
    PredCombo(PredComboPayload),
    /// Must-epoch meta-operation.
    MustEpoch(Box<MustEpochPayload>),
    /// Pending partition.
    PendingPartition(PendingPartitionPayload),
    /// Dependent partition.
    DependentPartition(DependentPartitionPayload),
    /// Fill.
    Fill(FillPayload),
    /// Attach.
    Attach(AttachPayload),
    /// Detach.
    Detach(DetachPayload),
    /// Trace-capture sentinel.
    TraceCapture(TraceCapturePayload),
    /// Trace-complete fence.
    TraceComplete(TraceCompletePayload),
    /// Task launch.
    Task(TaskPayload),
}
