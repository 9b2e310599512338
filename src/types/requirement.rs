//! Region requirements and the dependence-type lattice.
//!
//! A [`RegionRequirement`] names the logical region an operation touches,
//! the fields it uses, and the privilege/coherence pair it needs. The
//! dependence analyzer compares requirement pairs with
//! [`RegionRequirement::dependence_type`] to decide whether an edge is
//! needed and of which kind.

use crate::types::{FieldMask, IndexPartition, LogicalRegion};

/// Access privilege requested on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrivilegeMode {
    /// No access; the requirement only names the region.
    NoAccess,
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
    /// Write access that discards prior contents.
    WriteDiscard,
}

impl PrivilegeMode {
    /// Returns true if the privilege permits reading.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Returns true if the privilege permits writing.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }

    /// Returns true if `self` subsumes `other` (a holder of `self` may
    /// grant `other` to a child).
    #[must_use]
    pub const fn subsumes(self, other: Self) -> bool {
        match other {
            Self::NoAccess => true,
            Self::ReadOnly => self.is_read() || self.is_write(),
            Self::ReadWrite | Self::WriteDiscard => self.is_write(),
        }
    }
}

/// Coherence annotation on a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CoherenceMode {
    /// Exclusive access; conflicts order the operations.
    Exclusive,
    /// Atomic access; conflicting pairs may be reordered if serialized.
    Atomic,
    /// Simultaneous access; conflicting pairs may run concurrently on a
    /// shared instance.
    Simultaneous,
}

/// The kind of dependence between two requirements.
///
/// `True`, `Anti` and `Output` force ordering between the operations.
/// `Atomic` and `Simultaneous` arise when both sides relax coherence and
/// can be discharged by placement instead of ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependenceType {
    /// No interference.
    None,
    /// Read after write.
    True,
    /// Write after read.
    Anti,
    /// Write after write.
    Output,
    /// Conflicting accesses under mutual atomic coherence.
    Atomic,
    /// Conflicting accesses under mutual simultaneous coherence.
    Simultaneous,
}

impl DependenceType {
    /// Returns true if this dependence forces ordering between the two
    /// operations.
    #[must_use]
    pub const fn forces_ordering(self) -> bool {
        matches!(self, Self::True | Self::Anti | Self::Output)
    }

    /// Returns true if this dependence can be discharged by placement.
    #[must_use]
    pub const fn placement_resolvable(self) -> bool {
        matches!(self, Self::Atomic | Self::Simultaneous)
    }
}

/// One region requirement of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionRequirement {
    /// The logical region accessed.
    pub region: LogicalRegion,
    /// When set, the access goes through this partition of the region.
    pub partition: Option<IndexPartition>,
    /// The fields accessed.
    pub fields: FieldMask,
    /// The privilege requested.
    pub privilege: PrivilegeMode,
    /// The coherence annotation.
    pub coherence: CoherenceMode,
}

impl RegionRequirement {
    /// Creates an exclusive-coherence requirement.
    #[must_use]
    pub const fn new(region: LogicalRegion, fields: FieldMask, privilege: PrivilegeMode) -> Self {
        Self {
            region,
            partition: None,
            fields,
            privilege,
            coherence: CoherenceMode::Exclusive,
        }
    }

    /// Sets the coherence annotation.
    #[must_use]
    pub const fn with_coherence(mut self, coherence: CoherenceMode) -> Self {
        self.coherence = coherence;
        self
    }

    /// Routes the access through a partition of the region.
    #[must_use]
    pub const fn through_partition(mut self, partition: IndexPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Rewrites this requirement for a close operation issued on its
    /// behalf: the access is pinned to the region root and coherence is
    /// forced to exclusive.
    #[must_use]
    pub fn localized(&self) -> Self {
        let mut req = self.clone();
        req.partition = None;
        req.coherence = CoherenceMode::Exclusive;
        req
    }

    /// Computes the dependence carried from `prev` (the earlier user) to
    /// `self` (the later user). Returns [`DependenceType::None`] when the
    /// requirements touch different trees or disjoint fields, or when both
    /// sides only read.
    #[must_use]
    pub fn dependence_type(&self, prev: &Self) -> DependenceType {
        if self.region.tree != prev.region.tree {
            return DependenceType::None;
        }
        if !self.fields.overlaps(prev.fields) {
            return DependenceType::None;
        }
        if self.privilege == PrivilegeMode::NoAccess || prev.privilege == PrivilegeMode::NoAccess {
            return DependenceType::None;
        }
        if !self.privilege.is_write() && !prev.privilege.is_write() {
            return DependenceType::None;
        }
        // A real conflict; relaxed coherence on both sides downgrades it
        // to a placement constraint.
        match (prev.coherence, self.coherence) {
            (CoherenceMode::Atomic, CoherenceMode::Atomic) => DependenceType::Atomic,
            (CoherenceMode::Simultaneous, CoherenceMode::Simultaneous) => {
                DependenceType::Simultaneous
            }
            _ => match (prev.privilege.is_write(), self.privilege.is_write()) {
                (true, true) => DependenceType::Output,
                (true, false) => DependenceType::True,
                (false, true) => DependenceType::Anti,
                (false, false) => unreachable!("read-read handled above"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldSpace, IndexSpace, RegionTreeId};

    fn region(tree: u32) -> LogicalRegion {
        LogicalRegion::new(RegionTreeId(tree), IndexSpace(tree), FieldSpace(0))
    }

    fn req(tree: u32, fields: &[u32], privilege: PrivilegeMode) -> RegionRequirement {
        RegionRequirement::new(
            region(tree),
            FieldMask::from_fields(fields.iter().copied()),
            privilege,
        )
    }

    #[test]
    fn read_read_is_independent() {
        let a = req(0, &[0], PrivilegeMode::ReadOnly);
        let b = req(0, &[0], PrivilegeMode::ReadOnly);
        assert_eq!(b.dependence_type(&a), DependenceType::None);
    }

    #[test]
    fn raw_war_waw() {
        let w = req(0, &[0], PrivilegeMode::ReadWrite);
        let r = req(0, &[0], PrivilegeMode::ReadOnly);
        assert_eq!(r.dependence_type(&w), DependenceType::True);
        assert_eq!(w.dependence_type(&r), DependenceType::Anti);
        assert_eq!(w.dependence_type(&w), DependenceType::Output);
    }

    #[test]
    fn disjoint_fields_or_trees_are_independent() {
        let a = req(0, &[0], PrivilegeMode::ReadWrite);
        let b = req(0, &[1], PrivilegeMode::ReadWrite);
        let c = req(1, &[0], PrivilegeMode::ReadWrite);
        assert_eq!(b.dependence_type(&a), DependenceType::None);
        assert_eq!(c.dependence_type(&a), DependenceType::None);
    }

    #[test]
    fn relaxed_coherence_downgrades() {
        let a = req(0, &[0], PrivilegeMode::ReadWrite).with_coherence(CoherenceMode::Atomic);
        let b = req(0, &[0], PrivilegeMode::ReadWrite).with_coherence(CoherenceMode::Atomic);
        assert_eq!(b.dependence_type(&a), DependenceType::Atomic);

        let c = req(0, &[0], PrivilegeMode::ReadWrite).with_coherence(CoherenceMode::Simultaneous);
        let d = req(0, &[0], PrivilegeMode::ReadWrite).with_coherence(CoherenceMode::Simultaneous);
        assert_eq!(d.dependence_type(&c), DependenceType::Simultaneous);

        // Mixed coherence keeps the ordering dependence.
        assert_eq!(c.dependence_type(&a), DependenceType::Output);
    }

    #[test]
    fn localized_pins_root_and_exclusive() {
        let r = req(0, &[0], PrivilegeMode::ReadWrite)
            .with_coherence(CoherenceMode::Simultaneous)
            .through_partition(crate::types::IndexPartition(4));
        let l = r.localized();
        assert_eq!(l.partition, None);
        assert_eq!(l.coherence, CoherenceMode::Exclusive);
        assert_eq!(l.region, r.region);
    }

    #[test]
    fn privilege_subsumption() {
        assert!(PrivilegeMode::ReadWrite.subsumes(PrivilegeMode::ReadOnly));
        assert!(PrivilegeMode::ReadWrite.subsumes(PrivilegeMode::WriteDiscard));
        assert!(!PrivilegeMode::ReadOnly.subsumes(PrivilegeMode::ReadWrite));
        assert!(PrivilegeMode::NoAccess.subsumes(PrivilegeMode::NoAccess));
    }

    #[test]
    fn ordering_classification() {
        assert!(DependenceType::True.forces_ordering());
        assert!(DependenceType::Anti.forces_ordering());
        assert!(DependenceType::Output.forces_ordering());
        assert!(DependenceType::Atomic.placement_resolvable());
        assert!(DependenceType::Simultaneous.placement_resolvable());
        assert!(!DependenceType::None.forces_ordering());
    }
}
