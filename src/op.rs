//! The operation traits callers implement.
//!
//! Each method has a no-op default, so an op implements only the phases it
//! takes part in:
//!
//! - [`RepoOnlyOp`]: phase 1 (`update_repo`) and phase 3 (`post_update`).
//! - [`BatchUpdateOp`]: adds phase 2 (`update_change`) for one change.
//! - [`InsertChangeOp`]: a change op that also creates its change.
//! - [`AsyncPostUpdateOp`]: background work after phase 3.

use crate::change::Change;
use crate::context::{AsyncContext, ChangeContext, Context, PostUpdateContext, RepoContext};
use crate::error::OpError;

/// An operation on the repository only.
pub trait RepoOnlyOp: Send {
    /// Stage ref commands and write objects.
    ///
    /// # Errors
    /// Any error aborts the whole update before a ref is written.
    fn update_repo(&mut self, _ctx: &mut RepoContext<'_>) -> Result<(), OpError> {
        Ok(())
    }

    /// Side effects after every write and reindex finished.
    ///
    /// # Errors
    /// Returned to the caller; the writes stay in place.
    fn post_update(&mut self, _ctx: &mut PostUpdateContext<'_>) -> Result<(), OpError> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// An operation on one change.
pub trait BatchUpdateOp: RepoOnlyOp {
    /// Stage metadata updates through `ctx`.
    ///
    /// Returns `true` if the change needs to be written. When no op of a
    /// change returns `true`, nothing is written and nothing reindexed.
    ///
    /// # Errors
    /// Any error discards every staged update of the batch.
    fn update_change(&mut self, _ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        Ok(false)
    }
}

/// A change op that creates the change it works on.
pub trait InsertChangeOp: BatchUpdateOp {
    /// Build the new change. Called once, when the op is registered.
    ///
    /// # Errors
    /// Registration fails with the mapped error.
    fn create_change(&mut self, ctx: &dyn Context) -> Result<Change, OpError>;
}

/// Work run on the background pool after the update finished. Failures are
/// logged and otherwise ignored.
pub trait AsyncPostUpdateOp: Send + Sync {
    /// Run the work.
    ///
    /// # Errors
    /// Logged only.
    fn async_post_update(&self, ctx: &AsyncContext) -> Result<(), OpError>;
}

/// A registered op, by capability.
pub(crate) enum OpSlot {
    Repo(Box<dyn RepoOnlyOp>),
    Change(Box<dyn BatchUpdateOp>),
    Insert(Box<dyn InsertChangeOp>),
}

impl OpSlot {
    pub(crate) fn update_repo(&mut self, ctx: &mut RepoContext<'_>) -> Result<(), OpError> {
        match self {
            Self::Repo(op) => op.update_repo(ctx),
            Self::Change(op) => op.update_repo(ctx),
            Self::Insert(op) => op.update_repo(ctx),
        }
    }

    pub(crate) fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        match self {
            Self::Repo(_) => Ok(false),
            Self::Change(op) => op.update_change(ctx),
            Self::Insert(op) => op.update_change(ctx),
        }
    }

    pub(crate) fn post_update(&mut self, ctx: &mut PostUpdateContext<'_>) -> Result<(), OpError> {
        match self {
            Self::Repo(op) => op.post_update(ctx),
            Self::Change(op) => op.post_update(ctx),
            Self::Insert(op) => op.post_update(ctx),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Repo(op) => op.name(),
            Self::Change(op) => op.name(),
            Self::Insert(op) => op.name(),
        }
    }
}
