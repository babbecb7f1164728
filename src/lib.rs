//! refbatch: a transactional batch update engine for code-review changes
//! whose metadata lives in git refs.
//!
//! Callers register operations on a [`BatchUpdate`], keyed by change, and
//! execute it. The engine runs every op's repository phase, then the change
//! phase that stages one metadata commit per touched patch set, writes all
//! ref commands in one atomic transaction, reindexes the written changes,
//! and finally runs post-update side effects. [`RetryHelper`] reruns whole
//! attempts on lock failures.
//!
//! Storage is reached through the `refbatch-git` crate's `GitRepo` and
//! `RepositoryStore` traits.

pub mod batch_ops;
pub mod batch_update;
pub mod change;
pub mod config;
pub mod context;
pub mod error;
pub mod index;
pub mod listener;
pub mod metrics;
pub mod notes;
pub mod notify;
pub mod op;
pub mod pool;
pub mod ref_update;
pub mod repo_view;
pub mod retry;
pub mod submission;
pub mod telemetry;
pub mod update_manager;
pub mod validators;

pub use batch_ops::BatchOpsExecutor;
pub use batch_update::{BatchUpdate, BatchUpdateFactory, ChangeResult, Order};
pub use change::{
    Account, AccountId, Change, ChangeData, ChangeId, ChangeStatus, CurrentUser, DraftComment,
    NotifyHandling,
};
pub use config::RefbatchConfig;
pub use context::{AsyncContext, ChangeContext, Context, PostUpdateContext, RepoContext};
pub use error::{ErrorStatus, OpError, UpdateError};
pub use op::{AsyncPostUpdateOp, BatchUpdateOp, InsertChangeOp, RepoOnlyOp};
pub use ref_update::{BatchRefUpdate, CommandResult, ReceiveCommand};
pub use retry::{ActionType, RetryHelper, RetryOptions};
pub use submission::{SubmissionExecutor, SubmissionListener};
