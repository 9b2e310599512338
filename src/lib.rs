//! opgraph: the operation-graph core of a deferred task-parallel runtime.
//!
//! # Overview
//!
//! Applications submit operations (inline mappings, copies, fills,
//! fences, partitioning, file attaches, predicate combinators,
//! must-parallel epochs, trace capture) through a [`context::TaskContext`].
//! Submission builds a dependence DAG among the operations; each one then
//! moves through a fixed lifecycle — dependence analysis, mapping,
//! execution, completion, commit — driven entirely by event firings.
//!
//! The heart of the design is the generation-tagged operation slot: every
//! inter-operation reference is a `(slot, generation)` pair, and commit
//! bumps the generation, so a reference into the past is detectably stale
//! and silently pruned rather than dangling.
//!
//! # Core Guarantees
//!
//! - **At-most-once stages**: every lifecycle trigger runs at most once
//!   per slot generation.
//! - **Deterministic analysis**: within one context, dependence analysis
//!   runs in program order on the submitting thread.
//! - **No blocking stages**: lifecycle transitions never wait; they
//!   enqueue deferred calls that workers drain.
//! - **Poison propagation**: a quashed operation's completion event fires
//!   poisoned and the poison travels along its out-edges.
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, field masks, domains, requirements
//! - [`event`]: events, reservations, futures, collectives
//! - [`op`]: the operation state machine and per-kind payloads
//! - [`predicate`]: monotone predicate cells
//! - [`trace`]: memoized dependence traces
//! - [`must_epoch`]: the must-parallel epoch sub-scheduler
//! - [`forest`]: the region-tree collaborator interface and default
//! - [`mapper`]: the mapper collaborator interface and default
//! - [`launcher`]: the argument bundles of the issue surface
//! - [`context`]: the parent-task submission surface
//! - [`runtime`]: slot table, work queue, pumps and workers
//! - [`config`]: runtime tunables
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod forest;
pub mod launcher;
pub mod mapper;
pub mod must_epoch;
pub mod op;
pub mod predicate;
pub mod runtime;
pub mod trace;
pub mod tracing_compat;
pub mod types;

pub use config::RuntimeConfig;
pub use context::TaskContext;
pub use error::{Error, ErrorKind, Result};
pub use event::{DynamicCollective, Event, Future, FutureMap, Reservation, UserEvent};
pub use launcher::{
    AttachLauncher, CoherenceLauncher, CopyLauncher, FillLauncher, IndexTaskLauncher,
    InlineLauncher, MustEpochLauncher, PhysicalRegion, TaskLauncher,
};
pub use op::{DeletionKind, FenceKind, FileMode, OpKind, RegistrationOutcome, TriggerOutcome};
pub use predicate::Predicate;
pub use runtime::{OpProbe, Runtime, WorkerPool};
pub use types::{
    CoherenceMode, DependenceType, Domain, DomainPoint, FieldMask, LogicalRegion, OpKey,
    PrivilegeMode, RegionRequirement, TraceId,
};
