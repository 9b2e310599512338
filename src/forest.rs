//! The region-tree collaborator: logical state queries feeding dependence
//! analysis, plus the partition/attach primitives invoked at execution.
//!
//! The graph core consumes [`RegionForest`] as an abstract interface. The
//! in-crate [`SimpleForest`] models flat region trees with at most one
//! open partition per tree: access through a partition opens it, direct
//! access while a partition is open forces an inter-close issued through
//! the parent context. That is enough logical structure to exercise every
//! edge kind the core distinguishes.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::context::TaskContext;
use crate::event::{Event, UserEvent};
use crate::mapper::{InstanceId, MemoryId, Placement};
use crate::op::{
    AttachPayload, DeletionKind, DependentPartitionKind, DetachPayload, PartitionThunk,
};
use crate::tracing_compat::{debug, trace};
use crate::types::{
    DependenceType, FieldSpace, IndexPartition, IndexSpace, LogicalRegion, OpKey,
    RegionRequirement, RegionTreeId,
};

/// One recorded user of a region tree's logical state.
///
/// The forest holds a mapping reference on the user's operation for as
/// long as the user is live; later operations may still register edges on
/// it.
#[derive(Debug, Clone)]
pub struct LogicalUser {
    /// The operation that accessed the region.
    pub op: OpKey,
    /// Which of its requirements performed the access.
    pub req_index: u32,
    /// The requirement itself.
    pub requirement: RegionRequirement,
}

/// Logical-state queries and physical primitives consumed by the core.
pub trait RegionForest: Send + Sync {
    /// Creates a fresh logical region in its own tree.
    fn create_region(&self) -> LogicalRegion;

    /// Creates a partition of a region. Disjoint partitions carry the
    /// guarantee that accesses through distinct pieces do not interfere.
    fn create_partition(&self, region: LogicalRegion, disjoint: bool) -> IndexPartition;

    /// Walks the logical state for one requirement of `source`,
    /// registering dependences on prior users through the runtime and
    /// issuing close operations through `ctx` where the state demands it.
    fn analyze(&self, ctx: &TaskContext, source: OpKey, idx: u32, req: &RegionRequirement);

    /// Registers dependences of a deletion on every live user of the
    /// deleted resource.
    fn analyze_deletion(&self, ctx: &TaskContext, source: OpKey, kind: &DeletionKind);

    /// Drains all live users, tree by tree, releasing no references; the
    /// caller (context teardown) issues post-close operations over them
    /// and releases the references itself.
    fn take_tree_users(&self) -> Vec<(RegionTreeId, Vec<LogicalUser>)>;

    /// Issues the data movement of a copy; the returned event fires when
    /// the transfer is done.
    fn issue_copy(&self, srcs: &[RegionRequirement], dsts: &[RegionRequirement]) -> Event;

    /// Issues a fill of the named fields.
    fn issue_fill(&self, req: &RegionRequirement, value: &[u8]) -> Event;

    /// Closes up the physical state named by a (localized) close
    /// requirement.
    fn close_region(&self, req: &RegionRequirement) -> Event;

    /// Performs a deferred partition computation.
    fn perform_partition(&self, thunk: &PartitionThunk) -> Event;

    /// Computes a data-dependent partition.
    fn compute_dependent_partition(
        &self,
        kind: DependentPartitionKind,
        req: &RegionRequirement,
        partition: IndexPartition,
        projection: Option<IndexPartition>,
    ) -> Event;

    /// Binds an external file to a physical instance.
    fn attach_file(&self, payload: &AttachPayload) -> Event;

    /// Tears down an external-file instance.
    fn detach_file(&self, payload: &DetachPayload) -> Event;

    /// Destroys the resource named by a committed deletion.
    fn destroy(&self, kind: &DeletionKind);

    /// Number of analysis walks performed; used to observe that trace
    /// replay bypasses the analyzer.
    fn analysis_count(&self) -> u64 {
        0
    }
}

#[derive(Debug, Default)]
struct TreeState {
    open_partition: Option<IndexPartition>,
    users: Vec<LogicalUser>,
}

#[derive(Debug, Clone, Copy)]
struct PartitionInfo {
    tree: RegionTreeId,
    disjoint: bool,
}

#[derive(Default)]
struct ForestState {
    trees: HashMap<RegionTreeId, TreeState>,
    partitions: HashMap<IndexPartition, PartitionInfo>,
    destroyed_trees: Vec<RegionTreeId>,
    next_tree: u32,
    next_space: u32,
    next_partition: u32,
}

/// External-file memory. Offsets are handed out monotonically and never
/// reclaimed, so an ordered map can recover the instance owning any
/// interior offset (needed for remote writes addressed by raw offset).
pub struct FileMemory {
    next_offset: AtomicU64,
    offset_map: Mutex<BTreeMap<u64, InstanceId>>,
    next_instance: AtomicU64,
}

impl FileMemory {
    /// Creates an empty file memory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_offset: AtomicU64::new(0),
            offset_map: Mutex::new(BTreeMap::new()),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Hands out the next offset range; never reuses freed space.
    pub fn alloc_bytes(&self, size: u64) -> u64 {
        self.next_offset.fetch_add(size, Ordering::Relaxed)
    }

    /// Releases nothing; offsets stay live so the reverse lookup keeps
    /// working for remote writes.
    pub fn free_bytes(&self, _offset: u64, _size: u64) {}

    /// Creates an instance spanning `size` bytes and records its offset.
    pub fn create_instance(&self, size: u64) -> (InstanceId, u64) {
        let offset = self.alloc_bytes(size);
        let instance = InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed));
        self.offset_map.lock().insert(offset, instance);
        (instance, offset)
    }

    /// Maps an interior offset back to its instance and relative offset:
    /// find the first entry after the offset, then back up one.
    #[must_use]
    pub fn instance_at(&self, offset: u64) -> Option<(InstanceId, u64)> {
        debug_assert!(offset < self.next_offset.load(Ordering::Relaxed));
        let map = self.offset_map.lock();
        map.range(..=offset)
            .next_back()
            .map(|(base, instance)| (*instance, offset - base))
    }
}

impl Default for FileMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-crate default forest.
pub struct SimpleForest {
    state: Mutex<ForestState>,
    file_memory: FileMemory,
    analysis_calls: AtomicU64,
    fail_partitions: AtomicBool,
}

impl SimpleForest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ForestState::default()),
            file_memory: FileMemory::new(),
            analysis_calls: AtomicU64::new(0),
            fail_partitions: AtomicBool::new(false),
        }
    }

    /// The file memory backing attach operations.
    #[must_use]
    pub fn file_memory(&self) -> &FileMemory {
        &self.file_memory
    }

    /// Makes subsequent partition computations report failure; their
    /// ready events fire poisoned.
    pub fn fail_partition_computations(&self, fail: bool) {
        self.fail_partitions.store(fail, Ordering::Relaxed);
    }

    /// Returns true if the tree was destroyed by a committed deletion.
    #[must_use]
    pub fn tree_destroyed(&self, tree: RegionTreeId) -> bool {
        self.state.lock().destroyed_trees.contains(&tree)
    }

    /// Live user count on a tree, for inspection in tests.
    #[must_use]
    pub fn user_count(&self, tree: RegionTreeId) -> usize {
        self.state
            .lock()
            .trees
            .get(&tree)
            .map_or(0, |t| t.users.len())
    }

    /// The region tree a partition belongs to, if known.
    #[must_use]
    pub fn partition_parent_tree(&self, partition: IndexPartition) -> Option<RegionTreeId> {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .map(|info| info.tree)
    }

    fn partition_disjoint(&self, partition: IndexPartition) -> bool {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .is_some_and(|p| p.disjoint)
    }

    /// Dependence between a prior user and a new requirement, honoring
    /// disjoint-partition siblings.
    fn user_dependence(
        &self,
        prev: &RegionRequirement,
        next: &RegionRequirement,
    ) -> DependenceType {
        if let (Some(p), Some(q)) = (prev.partition, next.partition) {
            if p == q && self.partition_disjoint(p) {
                return DependenceType::None;
            }
        }
        next.dependence_type(prev)
    }

    fn partition_event(&self) -> Event {
        if self.fail_partitions.load(Ordering::Relaxed) {
            let failed = UserEvent::new();
            failed.trigger_poisoned();
            failed.event()
        } else {
            Event::completed()
        }
    }
}

impl Default for SimpleForest {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionForest for SimpleForest {
    fn create_region(&self) -> LogicalRegion {
        let mut state = self.state.lock();
        let tree = RegionTreeId(state.next_tree);
        state.next_tree += 1;
        let space = IndexSpace(state.next_space);
        state.next_space += 1;
        state.trees.insert(tree, TreeState::default());
        LogicalRegion::new(tree, space, FieldSpace(tree.0))
    }

    fn create_partition(&self, region: LogicalRegion, disjoint: bool) -> IndexPartition {
        let mut state = self.state.lock();
        let partition = IndexPartition(state.next_partition);
        state.next_partition += 1;
        state.partitions.insert(
            partition,
            PartitionInfo {
                tree: region.tree,
                disjoint,
            },
        );
        partition
    }

    fn analyze(&self, ctx: &TaskContext, source: OpKey, idx: u32, req: &RegionRequirement) {
        self.analysis_calls.fetch_add(1, Ordering::Relaxed);
        let runtime = ctx.runtime().clone();

        // Decide whether the access forces a close of an open partition;
        // collect the victims outside the close issuance to keep this
        // lock and the op locks disjoint.
        let close_victims: Option<Vec<LogicalUser>> = {
            let mut state = self.state.lock();
            let tree = state.trees.entry(req.region.tree).or_default();
            match (tree.open_partition, req.partition) {
                (Some(open), through) if through != Some(open) => {
                    let (victims, kept): (Vec<_>, Vec<_>) = tree
                        .users
                        .drain(..)
                        .partition(|u| u.requirement.partition == Some(open));
                    tree.users = kept;
                    tree.open_partition = through;
                    Some(victims)
                }
                (None, Some(through)) => {
                    tree.open_partition = Some(through);
                    None
                }
                _ => None,
            }
        };

        if let Some(victims) = close_victims {
            // issue_inter_close installs the close's user reference before
            // its analysis ends, so the new user entry below is already
            // covered.
            let close = ctx.issue_inter_close(req.localized(), source, &victims);
            for victim in &victims {
                runtime.remove_mapping_reference(victim.op);
            }
            if let Some(close_key) = close {
                self.state
                    .lock()
                    .trees
                    .entry(req.region.tree)
                    .or_default()
                    .users
                    .push(LogicalUser {
                        op: close_key,
                        req_index: 0,
                        requirement: req.localized(),
                    });
            }
        }

        // Walk the remaining users, register edges, and retire users the
        // new access dominates.
        let users: Vec<LogicalUser> = {
            let state = self.state.lock();
            state
                .trees
                .get(&req.region.tree)
                .map(|t| t.users.clone())
                .unwrap_or_default()
        };

        let mut retired = Vec::new();
        for user in &users {
            if user.op == source {
                continue;
            }
            let dtype = self.user_dependence(&user.requirement, req);
            if dtype == DependenceType::None {
                continue;
            }
            let validates =
                dtype == DependenceType::True && user.requirement.region == req.region;
            let mask = user.requirement.fields & req.fields;
            let outcome = runtime.register_region_dependence(
                source,
                idx,
                user.op,
                user.req_index,
                dtype,
                validates,
                mask,
            );
            trace!(?source, target = ?user.op, ?dtype, ?outcome, "analyzed region dependence");
            if !outcome.edge_added() && !matches!(outcome, crate::op::RegistrationOutcome::EpochInterposed) {
                retired.push(user.op);
                continue;
            }
            if dtype.forces_ordering()
                && req.privilege.is_write()
                && req.fields.dominates(user.requirement.fields)
                && req.partition == user.requirement.partition
            {
                retired.push(user.op);
            }
        }

        runtime.add_mapping_reference(source);
        {
            let mut state = self.state.lock();
            let tree = state.trees.entry(req.region.tree).or_default();
            tree.users.retain(|u| !retired.contains(&u.op));
            tree.users.push(LogicalUser {
                op: source,
                req_index: idx,
                requirement: req.clone(),
            });
        }
        for op in retired {
            runtime.remove_mapping_reference(op);
        }
    }

    fn analyze_deletion(&self, ctx: &TaskContext, source: OpKey, kind: &DeletionKind) {
        let Some(tree) = kind.region_tree() else {
            return;
        };
        let users: Vec<LogicalUser> = {
            let state = self.state.lock();
            state
                .trees
                .get(&tree)
                .map(|t| t.users.clone())
                .unwrap_or_default()
        };
        let runtime = ctx.runtime();
        for user in users {
            let _ = runtime.register_dependence(source, user.op);
        }
        debug!(?source, ?tree, "deletion analyzed");
    }

    fn take_tree_users(&self) -> Vec<(RegionTreeId, Vec<LogicalUser>)> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();
        for (tree, tree_state) in &mut state.trees {
            if !tree_state.users.is_empty() {
                tree_state.open_partition = None;
                drained.push((*tree, std::mem::take(&mut tree_state.users)));
            }
        }
        drained.sort_by_key(|(tree, _)| *tree);
        drained
    }

    fn issue_copy(&self, _srcs: &[RegionRequirement], _dsts: &[RegionRequirement]) -> Event {
        Event::completed()
    }

    fn issue_fill(&self, _req: &RegionRequirement, _value: &[u8]) -> Event {
        Event::completed()
    }

    fn close_region(&self, _req: &RegionRequirement) -> Event {
        Event::completed()
    }

    fn perform_partition(&self, thunk: &PartitionThunk) -> Event {
        if let PartitionThunk::Equal { partition, .. }
        | PartitionThunk::Weighted { partition, .. }
        | PartitionThunk::Union { partition, .. }
        | PartitionThunk::Intersection { partition, .. }
        | PartitionThunk::Difference { partition, .. } = thunk
        {
            // Computed handles become queryable once the thunk runs.
            let mut state = self.state.lock();
            state.partitions.entry(*partition).or_insert(PartitionInfo {
                tree: RegionTreeId(u32::MAX),
                disjoint: false,
            });
        }
        self.partition_event()
    }

    fn compute_dependent_partition(
        &self,
        _kind: DependentPartitionKind,
        _req: &RegionRequirement,
        partition: IndexPartition,
        _projection: Option<IndexPartition>,
    ) -> Event {
        let mut state = self.state.lock();
        state.partitions.entry(partition).or_insert(PartitionInfo {
            tree: RegionTreeId(u32::MAX),
            disjoint: false,
        });
        drop(state);
        self.partition_event()
    }

    fn attach_file(&self, payload: &AttachPayload) -> Event {
        // One fixed-size allocation per attached field; the offset map
        // supports the reverse lookup contract.
        let fields = payload.field_map.len().max(1) as u64;
        let (instance, offset) = self.file_memory.create_instance(fields * 4096);
        payload.region.bind_instance(Placement {
            memory: MemoryId(1),
            instance,
        });
        debug!(
            file = %payload.file_name,
            mode = ?payload.mode,
            offset,
            "external file attached"
        );
        Event::completed()
    }

    fn detach_file(&self, payload: &DetachPayload) -> Event {
        debug!(region = ?payload.region.region(), "external file detached");
        Event::completed()
    }

    fn destroy(&self, kind: &DeletionKind) {
        if let Some(tree) = kind.region_tree() {
            let mut state = self.state.lock();
            state.trees.remove(&tree);
            state.destroyed_trees.push(tree);
        }
    }

    fn analysis_count(&self) -> u64 {
        self.analysis_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_memory_offsets_are_monotone() {
        let memory = FileMemory::new();
        let a = memory.alloc_bytes(100);
        let b = memory.alloc_bytes(50);
        let c = memory.alloc_bytes(1);
        assert!(a < b && b < c);
        // free_bytes never reclaims.
        memory.free_bytes(a, 100);
        let d = memory.alloc_bytes(10);
        assert!(d > c);
    }

    #[test]
    fn file_memory_reverse_lookup() {
        let memory = FileMemory::new();
        let (first, off1) = memory.create_instance(100);
        let (second, off2) = memory.create_instance(200);
        assert_eq!(memory.instance_at(off1), Some((first, 0)));
        assert_eq!(memory.instance_at(off1 + 99), Some((first, 99)));
        assert_eq!(memory.instance_at(off2), Some((second, 0)));
        assert_eq!(memory.instance_at(off2 + 5), Some((second, 5)));
    }

    #[test]
    fn regions_get_distinct_trees() {
        let forest = SimpleForest::new();
        let a = forest.create_region();
        let b = forest.create_region();
        assert_ne!(a.tree, b.tree);
    }

    #[test]
    fn partition_disjointness_is_recorded() {
        let forest = SimpleForest::new();
        let region = forest.create_region();
        let disjoint = forest.create_partition(region, true);
        let aliased = forest.create_partition(region, false);
        assert!(forest.partition_disjoint(disjoint));
        assert!(!forest.partition_disjoint(aliased));
        assert_eq!(forest.partition_parent_tree(disjoint), Some(region.tree));
        assert_eq!(forest.partition_parent_tree(IndexPartition(999)), None);
    }

    #[test]
    fn destroy_marks_tree() {
        let forest = SimpleForest::new();
        let region = forest.create_region();
        assert!(!forest.tree_destroyed(region.tree));
        forest.destroy(&DeletionKind::LogicalRegion(region));
        assert!(forest.tree_destroyed(region.tree));
    }
}
