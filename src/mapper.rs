//! The mapper collaborator: placement decisions and speculation policy.
//!
//! The graph core never chooses placements itself; it asks a [`Mapper`].
//! The crate ships a [`DefaultMapper`] good enough to exercise the core:
//! fresh instances for independent requirements, shared instances for
//! must-epoch constraints, and no speculation unless configured.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::op::OpKind;
use crate::types::{DependenceType, DomainPoint, RegionRequirement};

/// A memory in which instances are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub u32);

/// A physical instance handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// A placement decision for one requirement or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// The memory holding the instance.
    pub memory: MemoryId,
    /// The instance bound to the requirement.
    pub instance: InstanceId,
}

/// A placement constraint between two must-epoch members, produced from a
/// placement-resolvable dependence between their requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingConstraint {
    /// Index of the first member within the epoch.
    pub op1: u32,
    /// Requirement index of the first member.
    pub reg1: u32,
    /// Index of the second member within the epoch.
    pub op2: u32,
    /// Requirement index of the second member.
    pub reg2: u32,
    /// The dependence the constraint discharges.
    pub dtype: DependenceType,
}

/// What the mapper decides about an unresolved predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speculation {
    /// Do not speculate; wait for the predicate to resolve.
    Refuse,
    /// Speculate with the given value.
    Value(bool),
}

/// Read-only view of one must-epoch member handed to the mapper.
#[derive(Debug, Clone)]
pub struct EpochTaskView {
    /// Index of the member within the epoch.
    pub index: u32,
    /// The point the member occupies in its launch domain.
    pub point: DomainPoint,
    /// The member's region requirements.
    pub requirements: Vec<RegionRequirement>,
}

/// Placement and speculation policy consumed by the graph core.
pub trait Mapper: Send + Sync {
    /// Chooses a placement for an inline mapping.
    fn map_inline(&self, req: &RegionRequirement) -> Placement;

    /// Chooses placements for a copy: one per source, then one per
    /// destination.
    fn map_copy(
        &self,
        srcs: &[RegionRequirement],
        dsts: &[RegionRequirement],
    ) -> Vec<Placement>;

    /// Chooses a placement for a task launch.
    fn map_task(&self, reqs: &[RegionRequirement]) -> Placement;

    /// Maps a whole must-epoch at once. The returned vector is parallel to
    /// `tasks`. Placements must satisfy `constraints`; the epoch verifies
    /// and fails with `MustEpochInfeasible` otherwise.
    fn map_must_epoch(
        &self,
        tasks: &[EpochTaskView],
        constraints: &[MappingConstraint],
    ) -> Result<Vec<Placement>>;

    /// Asks whether to speculate on an unresolved predicate for an op of
    /// the given kind.
    fn speculate(&self, kind: OpKind) -> Speculation {
        let _ = kind;
        Speculation::Refuse
    }
}

/// A minimal mapper: fresh instances everywhere, shared instances where a
/// must-epoch constraint demands it, never speculates.
#[derive(Debug, Default)]
pub struct DefaultMapper {
    next_instance: AtomicU64,
}

impl DefaultMapper {
    /// Creates the mapper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_instance(&self) -> InstanceId {
        InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed))
    }
}

impl Mapper for DefaultMapper {
    fn map_inline(&self, _req: &RegionRequirement) -> Placement {
        Placement {
            memory: MemoryId(0),
            instance: self.fresh_instance(),
        }
    }

    fn map_copy(
        &self,
        srcs: &[RegionRequirement],
        dsts: &[RegionRequirement],
    ) -> Vec<Placement> {
        (0..srcs.len() + dsts.len())
            .map(|_| Placement {
                memory: MemoryId(0),
                instance: self.fresh_instance(),
            })
            .collect()
    }

    fn map_task(&self, _reqs: &[RegionRequirement]) -> Placement {
        Placement {
            memory: MemoryId(0),
            instance: self.fresh_instance(),
        }
    }

    fn map_must_epoch(
        &self,
        tasks: &[EpochTaskView],
        constraints: &[MappingConstraint],
    ) -> Result<Vec<Placement>> {
        // Union-find over members so constrained pairs land on one
        // instance.
        let mut root: Vec<usize> = (0..tasks.len()).collect();
        fn find(root: &mut [usize], mut i: usize) -> usize {
            while root[i] != i {
                root[i] = root[root[i]];
                i = root[i];
            }
            i
        }
        for constraint in constraints {
            let a = usize::try_from(constraint.op1)
                .ok()
                .filter(|i| *i < tasks.len());
            let b = usize::try_from(constraint.op2)
                .ok()
                .filter(|i| *i < tasks.len());
            let (Some(a), Some(b)) = (a, b) else {
                return Err(Error::must_epoch_infeasible(
                    "constraint names an unknown epoch member",
                ));
            };
            let (ra, rb) = (find(&mut root, a), find(&mut root, b));
            root[ra] = rb;
        }
        let mut class_instance: Vec<Option<InstanceId>> = vec![None; tasks.len()];
        let mut placements = Vec::with_capacity(tasks.len());
        for i in 0..tasks.len() {
            let class = find(&mut root, i);
            let instance =
                *class_instance[class].get_or_insert_with(|| self.fresh_instance());
            placements.push(Placement {
                memory: MemoryId(0),
                instance,
            });
        }
        Ok(placements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        FieldMask, FieldSpace, IndexSpace, LogicalRegion, PrivilegeMode, RegionTreeId,
    };

    fn req() -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion::new(RegionTreeId(0), IndexSpace(0), FieldSpace(0)),
            FieldMask::single(0),
            PrivilegeMode::ReadWrite,
        )
    }

    fn view(index: u32) -> EpochTaskView {
        EpochTaskView {
            index,
            point: DomainPoint::one_dim(i64::from(index)),
            requirements: vec![req()],
        }
    }

    #[test]
    fn inline_instances_are_distinct() {
        let mapper = DefaultMapper::new();
        let a = mapper.map_inline(&req());
        let b = mapper.map_inline(&req());
        assert_ne!(a.instance, b.instance);
    }

    #[test]
    fn copy_placements_cover_all_requirements() {
        let mapper = DefaultMapper::new();
        let placements = mapper.map_copy(&[req(), req()], &[req()]);
        assert_eq!(placements.len(), 3);
    }

    #[test]
    fn must_epoch_shares_constrained_instances() {
        let mapper = DefaultMapper::new();
        let tasks = [view(0), view(1), view(2)];
        let constraints = [MappingConstraint {
            op1: 0,
            reg1: 0,
            op2: 2,
            reg2: 0,
            dtype: DependenceType::Simultaneous,
        }];
        let placements = mapper.map_must_epoch(&tasks, &constraints).unwrap();
        assert_eq!(placements[0].instance, placements[2].instance);
        assert_ne!(placements[0].instance, placements[1].instance);
    }

    #[test]
    fn must_epoch_rejects_bad_constraint_indices() {
        let mapper = DefaultMapper::new();
        let tasks = [view(0)];
        let constraints = [MappingConstraint {
            op1: 0,
            reg1: 0,
            op2: 9,
            reg2: 0,
            dtype: DependenceType::Atomic,
        }];
        assert!(mapper.map_must_epoch(&tasks, &constraints).is_err());
    }

    #[test]
    fn default_speculation_refuses() {
        let mapper = DefaultMapper::new();
        assert_eq!(mapper.speculate(OpKind::Copy), Speculation::Refuse);
    }
}
