//! Error types for repository storage operations.
//!
//! [`GitError`] is returned by every [`GitRepo`](crate::GitRepo) and
//! [`RepositoryStore`](crate::RepositoryStore) method. Callers match on the
//! variant to tell optimistic-concurrency failures apart from I/O trouble.

use thiserror::Error;

/// Errors returned by [`GitRepo`](crate::GitRepo) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A requested object, ref, or repository was not found.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// A ref update failed because the ref's current value did not match the
    /// expected old value (compare-and-swap / optimistic concurrency failure).
    #[error("ref conflict on `{ref_name}`: {message}")]
    RefConflict {
        /// The ref that could not be updated.
        ref_name: String,
        /// Details about the mismatch.
        message: String,
    },

    /// An OID string could not be parsed or was otherwise invalid.
    #[error("invalid OID `{value}`: {reason}")]
    InvalidOid {
        /// The raw value that failed validation.
        value: String,
        /// Why validation failed.
        reason: String,
    },

    /// An I/O error occurred while touching the repository on disk.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The storage backend returned an unclassified error.
    #[error("git backend error: {message}")]
    BackendError {
        /// Freeform error description from the backend.
        message: String,
    },
}

impl GitError {
    /// `true` when the failure is a compare-and-swap mismatch on a ref.
    #[must_use]
    pub const fn is_ref_conflict(&self) -> bool {
        matches!(self, Self::RefConflict { .. })
    }

    pub(crate) fn backend(message: impl std::fmt::Display) -> Self {
        Self::BackendError {
            message: message.to_string(),
        }
    }
}
