//! Errors raised by the core value types.

use thiserror::Error;

use crate::version::ExpectedVersion;

pub type DomainResult<T> = Result<T, DomainError>;

/// Failures that need no I/O to detect. Storage errors live in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{kind} rejected: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    /// A stream head or read-model record moved since it was read.
    #[error("version conflict: expected {expected:?}, found {actual}")]
    VersionConflict { expected: ExpectedVersion, actual: u64 },
}
