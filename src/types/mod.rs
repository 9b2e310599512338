//! Core types for the operation graph.
//!
//! - [`id`]: identifier and handle types (`OpKey`, `UniqueOpId`, region
//!   tree handles)
//! - [`field_mask`]: compact field sets for dependence analysis
//! - [`domain`]: type-erased points and index domains
//! - [`requirement`]: region requirements, privileges, coherence, and the
//!   dependence-type lattice

pub mod domain;
pub mod field_mask;
pub mod id;
pub mod requirement;

pub use domain::{Domain, DomainPoint, MAX_POINT_DIM};
pub use field_mask::FieldMask;
pub use id::{
    FieldId, FieldSpace, GenerationId, IndexPartition, IndexSpace, LogicalRegion, OpKey,
    RegionTreeId, TraceId, UniqueOpId,
};
pub use requirement::{
    CoherenceMode, DependenceType, PrivilegeMode, RegionRequirement,
};
