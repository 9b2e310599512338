//! Error types and error handling strategy for the operation graph.
//!
//! Errors are explicit and typed. Submission-time failures (privilege
//! violations, aliased requirements) are raised synchronously from the
//! issuing call; pipeline failures (infeasible must-epochs, failed
//! partition computations) surface asynchronously through poisoned
//! completion events and error payloads in futures.
//!
//! Two kinds are internal only: [`ErrorKind::StaleReference`] is always
//! suppressed by the registration paths, and
//! [`ErrorKind::PredicateMispredict`] drives the internal quash/restart
//! protocol without ever reaching the application.

use core::fmt;

use crate::types::UniqueOpId;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A launcher's region requirement is not subsumed by the parent
    /// context's privileges.
    PrivilegeCheck,
    /// Two region requirements of one operation conflict on the same
    /// logical state.
    AliasedRequirements,
    /// A must-epoch contains a true dependence among its children, or the
    /// mapper could not satisfy its constraints.
    MustEpochInfeasible,
    /// A speculated predicate value diverged from the resolved value.
    /// Internal; drives quash + restart of the misspeculated sub-graph.
    PredicateMispredict,
    /// A partition thunk reported failure; propagated as completion-event
    /// poison.
    PartitionComputeFailed,
    /// A `(slot, gen)` reference no longer names a live generation.
    /// Internal; suppressed, never surfaced.
    StaleReference,
    /// A lifecycle method was invoked outside its preconditions.
    InvalidStateTransition,
    /// Internal runtime error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns true if this kind never surfaces to the application.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::StaleReference | Self::PredicateMispredict)
    }
}

/// The main error type for operation-graph calls.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    op: Option<UniqueOpId>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            op: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attaches the unique id of the operation involved.
    #[must_use]
    pub const fn with_op(mut self, op: UniqueOpId) -> Self {
        self.op = Some(op);
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the unique id of the operation involved, if recorded.
    #[must_use]
    pub const fn op(&self) -> Option<UniqueOpId> {
        self.op
    }

    /// Creates a privilege-check failure for a requirement index.
    #[must_use]
    pub fn privilege_check(idx: usize, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::PrivilegeCheck)
            .with_message(format!("requirement {idx}: {}", detail.into()))
    }

    /// Creates an aliased-requirements failure for a pair of indices.
    #[must_use]
    pub fn aliased_requirements(idx1: usize, idx2: usize) -> Self {
        Self::new(ErrorKind::AliasedRequirements)
            .with_message(format!("requirements {idx1} and {idx2} interfere"))
    }

    /// Creates a must-epoch infeasibility error.
    #[must_use]
    pub fn must_epoch_infeasible(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::MustEpochInfeasible).with_message(detail)
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " (op {op})")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for operation-graph calls.
pub type Result<T> = core::result::Result<T, Error>;
