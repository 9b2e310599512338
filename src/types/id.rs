//! Identifier types for the operation graph.
//!
//! All inter-operation references carry a `(slot, generation)` pair
//! ([`OpKey`]); a reference whose generation no longer matches the slot's
//! current generation is stale and silently pruned by the registration
//! paths.

use core::fmt;
use core::hash::{Hash, Hasher};

/// Generation counter on an operation slot; bumped at commit.
pub type GenerationId = u32;

/// Globally unique operation id, assigned at initialize. Also the total
/// order used when two op locks must be held at once.
pub type UniqueOpId = u64;

/// A generation-tagged reference to an operation slot.
///
/// `OpKey` is the only way one operation names another. On every
/// dereference the generation is validated against the slot's current
/// generation; a mismatch means the target has committed and been recycled.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpKey {
    slot: u32,
    gen: GenerationId,
}

impl OpKey {
    /// Creates a key from a slot index and generation.
    #[inline]
    #[must_use]
    pub const fn new(slot: u32, gen: GenerationId) -> Self {
        Self { slot, gen }
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the generation this key refers to.
    #[inline]
    #[must_use]
    pub const fn gen(self) -> GenerationId {
        self.gen
    }
}

impl fmt::Debug for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpKey({}:{})", self.slot, self.gen)
    }
}

impl Hash for OpKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let packed = (u64::from(self.slot) << 32) | u64::from(self.gen);
        state.write_u64(packed);
    }
}

/// Identifies a memoized trace within a parent context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceId(pub u32);

/// Identifies a logical region tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionTreeId(pub u32);

/// An index space handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexSpace(pub u32);

/// An index partition handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexPartition(pub u32);

/// A field space handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldSpace(pub u32);

/// A field within a field space.
pub type FieldId = u32;

/// A logical region handle: a region tree paired with the index and field
/// spaces that span it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogicalRegion {
    /// The region tree this region belongs to.
    pub tree: RegionTreeId,
    /// The index space of the region.
    pub index_space: IndexSpace,
    /// The field space of the region.
    pub field_space: FieldSpace,
}

impl LogicalRegion {
    /// Creates a region handle.
    #[must_use]
    pub const fn new(tree: RegionTreeId, index_space: IndexSpace, field_space: FieldSpace) -> Self {
        Self {
            tree,
            index_space,
            field_space,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn op_key_debug() {
        let key = OpKey::new(5, 3);
        assert_eq!(format!("{key:?}"), "OpKey(5:3)");
    }

    #[test]
    fn op_key_ord_by_slot_then_gen() {
        let a = OpKey::new(1, 0);
        let b = OpKey::new(2, 0);
        let c = OpKey::new(1, 1);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn op_key_hash_distinguishes_generations() {
        let mut set = HashSet::new();
        set.insert(OpKey::new(1, 0));
        set.insert(OpKey::new(1, 1));
        set.insert(OpKey::new(1, 0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn logical_region_equality() {
        let r1 = LogicalRegion::new(RegionTreeId(1), IndexSpace(2), FieldSpace(3));
        let r2 = LogicalRegion::new(RegionTreeId(1), IndexSpace(2), FieldSpace(3));
        let r3 = LogicalRegion::new(RegionTreeId(2), IndexSpace(2), FieldSpace(3));
        assert_eq!(r1, r2);
        assert_ne!(r1, r3);
    }
}
