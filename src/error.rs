//! Error types for the batch update engine.
//!
//! Two layers:
//!
//! - [`OpError`] is what caller-supplied operations return. Its variants name
//!   well-known failure kinds (invalid operation, missing change, ...).
//! - [`UpdateError`] is what the engine returns. Converting an `OpError` into
//!   an `UpdateError` classifies it into a user-facing status or wraps it as a
//!   generic failure without a user-visible message.
//!
//! The retry loop looks only at [`UpdateError::is_retryable`].

use std::fmt;
use std::time::Duration;

use refbatch_git::{GitError, ProjectName};
use thiserror::Error;

use crate::change::ChangeId;

// ---------------------------------------------------------------------------
// ErrorStatus
// ---------------------------------------------------------------------------

/// REST-style status a handler would answer with for an [`UpdateError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    /// 409: the request conflicts with current state.
    Conflict,
    /// 404: the target does not exist.
    NotFound,
    /// 400: the request itself is unacceptable.
    BadRequest,
    /// 500: no user-visible explanation.
    Internal,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not found"),
            Self::BadRequest => write!(f, "bad request"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateError
// ---------------------------------------------------------------------------

/// Failure of a batch update, a submission, or a retried action.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The update conflicts with the current state of a change or ref.
    #[error("{0}")]
    Conflict(String),

    /// A change, ref, or project does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request was rejected as malformed or unacceptable.
    #[error("{0}")]
    BadRequest(String),

    /// A submit validator rejected the queued ref updates.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A concurrent writer moved a ref between read and write. Retryable.
    #[error("{message}")]
    LockFailure {
        /// Summary including the refs that failed.
        message: String,
        /// Refs whose compare-and-swap failed.
        refs: Vec<String>,
    },

    /// A ref batch finished with a result other than OK for reasons other
    /// than a lock failure.
    #[error("{0}")]
    RefUpdateRejected(String),

    /// The storage layer failed.
    #[error("storage error: {0}")]
    Storage(#[from] GitError),

    /// The engine was used incorrectly (mixed orders, duplicate projects,
    /// reuse after execution, ...).
    #[error("{0}")]
    Usage(String),

    /// The retry loop gave up. `source` is the last attempt's failure.
    #[error("{action} timed out after {attempts} attempts in {elapsed:?}")]
    Timeout {
        /// Name of the retried action.
        action: String,
        /// Attempts made.
        attempts: u32,
        /// Wall-clock time spent.
        elapsed: Duration,
        /// The last failure.
        #[source]
        source: Box<UpdateError>,
    },

    /// Any other failure. Carries no user-visible message.
    #[error("update failed")]
    Other(#[source] anyhow::Error),
}

impl UpdateError {
    /// `true` only for lock failures; every other failure propagates at once.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockFailure { .. })
    }

    /// The user-facing status for this failure.
    #[must_use]
    pub fn status(&self) -> ErrorStatus {
        match self {
            Self::Conflict(_) | Self::Validation(_) => ErrorStatus::Conflict,
            Self::NotFound(_) => ErrorStatus::NotFound,
            Self::BadRequest(_) => ErrorStatus::BadRequest,
            Self::Timeout { source, .. } => source.status(),
            Self::LockFailure { .. }
            | Self::RefUpdateRejected(_)
            | Self::Storage(_)
            | Self::Usage(_)
            | Self::Other(_) => ErrorStatus::Internal,
        }
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}

// ---------------------------------------------------------------------------
// OpError
// ---------------------------------------------------------------------------

/// Failure raised by a caller-supplied operation.
#[derive(Debug, Error)]
pub enum OpError {
    /// The operation cannot be applied to the change in its current state.
    #[error("{0}")]
    InvalidChangeOperation(String),

    /// A quota or limit would be exceeded.
    #[error("{0}")]
    LimitExceeded(String),

    /// The change does not exist.
    #[error("change {0} not found")]
    NoSuchChange(ChangeId),

    /// The ref does not exist.
    #[error("ref {0} not found")]
    NoSuchRef(String),

    /// The project does not exist.
    #[error("project {0} not found")]
    NoSuchProject(ProjectName),

    /// Published comments were rejected by a validator.
    #[error("comments rejected: {0}")]
    CommentsRejected(String),

    /// The operation decided on a REST-style conflict itself.
    #[error("{0}")]
    Conflict(String),

    /// The operation decided on a REST-style not-found itself.
    #[error("{0}")]
    NotFound(String),

    /// The operation decided on a REST-style bad-request itself.
    #[error("{0}")]
    BadRequest(String),

    /// An engine failure surfaced through a context call; propagated as-is.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Storage failure inside the operation.
    #[error(transparent)]
    Storage(#[from] GitError),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<OpError> for UpdateError {
    fn from(err: OpError) -> Self {
        match err {
            OpError::InvalidChangeOperation(m) | OpError::LimitExceeded(m) | OpError::Conflict(m) => {
                Self::Conflict(m)
            }
            e @ (OpError::NoSuchChange(_) | OpError::NoSuchRef(_) | OpError::NoSuchProject(_)) => {
                Self::NotFound(e.to_string())
            }
            OpError::NotFound(m) => Self::NotFound(m),
            e @ OpError::CommentsRejected(_) => Self::BadRequest(e.to_string()),
            OpError::BadRequest(m) => Self::BadRequest(m),
            OpError::Update(e) => e,
            OpError::Storage(e) => Self::Storage(e),
            OpError::Other(e) => Self::Other(e),
        }
    }
}
