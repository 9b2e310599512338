//! Compact field sets for dependence analysis.
//!
//! A [`FieldMask`] is a 64-bit set over field ids 0..64. Dependence
//! analysis only compares masks for overlap and containment, so a fixed
//! word is sufficient and keeps the hot path allocation-free.

use core::fmt;

use crate::types::FieldId;

/// A set of fields, one bit per field id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldMask(u64);

impl FieldMask {
    /// The maximum field id representable.
    pub const MAX_FIELD: FieldId = 63;

    /// The empty mask.
    pub const EMPTY: Self = Self(0);

    /// The mask containing every representable field.
    pub const ALL: Self = Self(u64::MAX);

    /// Creates a mask containing a single field.
    ///
    /// # Panics
    /// Panics if `field` exceeds [`Self::MAX_FIELD`].
    #[must_use]
    pub fn single(field: FieldId) -> Self {
        assert!(field <= Self::MAX_FIELD, "field id {field} out of range");
        Self(1u64 << field)
    }

    /// Creates a mask from an iterator of field ids.
    #[must_use]
    pub fn from_fields<I: IntoIterator<Item = FieldId>>(fields: I) -> Self {
        fields
            .into_iter()
            .fold(Self::EMPTY, |mask, f| mask | Self::single(f))
    }

    /// Returns true if no field is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the field is in the mask.
    #[must_use]
    pub fn contains(self, field: FieldId) -> bool {
        field <= Self::MAX_FIELD && (self.0 >> field) & 1 == 1
    }

    /// Returns true if the two masks share any field.
    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if `self` contains every field of `other`.
    #[inline]
    #[must_use]
    pub const fn dominates(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    /// Returns the number of fields set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates over the field ids in the mask, ascending.
    pub fn iter(self) -> impl Iterator<Item = FieldId> {
        (0..=Self::MAX_FIELD).filter(move |f| self.contains(*f))
    }
}

impl core::ops::BitOr for FieldMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for FieldMask {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_contains() {
        let mask = FieldMask::single(3);
        assert!(mask.contains(3));
        assert!(!mask.contains(4));
        assert_eq!(mask.len(), 1);
    }

    #[test]
    fn from_fields_collects() {
        let mask = FieldMask::from_fields([0, 5, 63]);
        assert_eq!(mask.len(), 3);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 5, 63]);
    }

    #[test]
    fn overlap_and_dominates() {
        let a = FieldMask::from_fields([1, 2, 3]);
        let b = FieldMask::from_fields([3, 4]);
        let c = FieldMask::from_fields([2, 3]);
        assert!(a.overlaps(b));
        assert!(!a.dominates(b));
        assert!(a.dominates(c));
        assert!(a.dominates(FieldMask::EMPTY));
        assert!(!FieldMask::EMPTY.overlaps(a));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn single_rejects_large_ids() {
        let _ = FieldMask::single(64);
    }
}
