//! Capability objects handed to operations, one per update phase.
//!
//! | Context              | Phase        | Can                                          |
//! |----------------------|--------------|----------------------------------------------|
//! | [`RepoContext`]      | update repo  | stage ref commands, write objects            |
//! | [`ChangeContext`]    | update change| stage metadata updates, delete the change    |
//! | [`PostUpdateContext`]| post update  | read written change data, schedule async work|
//! | [`AsyncContext`]     | async        | read written change data                     |
//!
//! Every context implements [`Context`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use refbatch_git::ProjectName;

use crate::change::{Account, Change, ChangeData, ChangeId, CurrentUser, NotifyHandling};
use crate::error::OpError;
use crate::notes::{ChangeNotes, ChangeUpdate};
use crate::op::AsyncPostUpdateOp;
use crate::ref_update::ReceiveCommand;
use crate::repo_view::{Inserter, RepoView};

/// What every phase can see.
pub trait Context {
    /// Project being updated.
    fn project(&self) -> &ProjectName;

    /// User the current operation runs as.
    fn user(&self) -> &CurrentUser;

    /// Timestamp shared by the whole update.
    fn when(&self) -> SystemTime;

    /// Notification setting for `change`: its override if one was set,
    /// else the update's default.
    fn notify(&self, change: ChangeId) -> NotifyHandling;
}

/// State shared by every context of one batch update.
#[derive(Clone, Debug)]
pub(crate) struct UpdateScope {
    pub(crate) project: ProjectName,
    pub(crate) when: SystemTime,
    pub(crate) notify: NotifyHandling,
    pub(crate) per_change_notify: HashMap<ChangeId, NotifyHandling>,
}

impl UpdateScope {
    pub(crate) fn new(project: ProjectName, when: SystemTime) -> Self {
        Self {
            project,
            when,
            notify: NotifyHandling::default(),
            per_change_notify: HashMap::new(),
        }
    }

    fn notify_for(&self, change: ChangeId) -> NotifyHandling {
        self.per_change_notify
            .get(&change)
            .copied()
            .unwrap_or(self.notify)
    }
}

macro_rules! impl_context {
    ($ty:ident) => {
        impl Context for $ty<'_> {
            fn project(&self) -> &ProjectName {
                &self.scope.project
            }

            fn user(&self) -> &CurrentUser {
                self.user
            }

            fn when(&self) -> SystemTime {
                self.scope.when
            }

            fn notify(&self, change: ChangeId) -> NotifyHandling {
                self.scope.notify_for(change)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// BaseContext
// ---------------------------------------------------------------------------

/// Context without phase-specific capabilities, used when registering
/// insert-change ops.
pub(crate) struct BaseContext<'a> {
    scope: &'a UpdateScope,
    user: &'a CurrentUser,
}

impl<'a> BaseContext<'a> {
    pub(crate) const fn new(scope: &'a UpdateScope, user: &'a CurrentUser) -> Self {
        Self { scope, user }
    }
}

impl_context!(BaseContext);

// ---------------------------------------------------------------------------
// RepoContext
// ---------------------------------------------------------------------------

/// Phase 1: repository mutations.
pub struct RepoContext<'a> {
    scope: &'a UpdateScope,
    user: &'a CurrentUser,
    view: &'a mut RepoView,
}

impl<'a> RepoContext<'a> {
    pub(crate) const fn new(
        scope: &'a UpdateScope,
        user: &'a CurrentUser,
        view: &'a mut RepoView,
    ) -> Self {
        Self { scope, user, view }
    }

    /// Stage a ref command. It is executed with the rest of the batch.
    ///
    /// # Errors
    /// Fails if the ref name is invalid or the command does not chain onto a
    /// command already staged for the same ref.
    pub fn add_ref_update(&mut self, cmd: ReceiveCommand) -> Result<(), OpError> {
        self.view.add_command(cmd)?;
        Ok(())
    }

    /// Object writer; flushed by the engine after every op ran.
    #[must_use]
    pub fn inserter(&self) -> Inserter<'_> {
        self.view.inserter()
    }

    /// The repository with staged commands applied.
    #[must_use]
    pub fn repo_view(&self) -> &RepoView {
        self.view
    }
}

impl_context!(RepoContext);

// ---------------------------------------------------------------------------
// ChangeContext
// ---------------------------------------------------------------------------

/// Per-change accumulator living for one execution of phase 2.
#[derive(Debug)]
pub(crate) struct ChangeState {
    pub(crate) change: Change,
    pub(crate) notes: Option<ChangeNotes>,
    pub(crate) is_new: bool,
    pub(crate) dirty: bool,
    pub(crate) deleted: bool,
    author: Option<Account>,
    when: SystemTime,
    finished: Vec<ChangeUpdate>,
    default_updates: BTreeMap<u32, ChangeUpdate>,
    distinct_updates: Vec<ChangeUpdate>,
}

impl ChangeState {
    pub(crate) fn existing(notes: ChangeNotes, author: Option<Account>, when: SystemTime) -> Self {
        Self {
            change: notes.change.clone(),
            notes: Some(notes),
            is_new: false,
            dirty: false,
            deleted: false,
            author,
            when,
            finished: Vec::new(),
            default_updates: BTreeMap::new(),
            distinct_updates: Vec::new(),
        }
    }

    /// State for a change being inserted; seeds the creating update.
    pub(crate) fn inserted(change: Change, author: Option<Account>, when: SystemTime) -> Self {
        let create = ChangeUpdate::for_new_change(&change, author.clone(), when);
        let mut default_updates = BTreeMap::new();
        default_updates.insert(create.patch_set(), create);
        Self {
            change,
            notes: None,
            is_new: true,
            dirty: false,
            deleted: false,
            author,
            when,
            finished: Vec::new(),
            default_updates,
            distinct_updates: Vec::new(),
        }
    }

    /// Start a new context for `author`; updates staged by the previous
    /// author are closed off.
    pub(crate) fn switch_author(&mut self, author: Option<Account>) {
        if self.author == author {
            return;
        }
        self.close_updates();
        self.author = author;
    }

    fn close_updates(&mut self) {
        self.finished
            .extend(std::mem::take(&mut self.default_updates).into_values());
        self.finished.append(&mut self.distinct_updates);
    }

    /// Every staged update, in staging order.
    pub(crate) fn into_updates(mut self) -> (Change, Option<ChangeNotes>, Vec<ChangeUpdate>) {
        self.close_updates();
        (self.change, self.notes, self.finished)
    }
}

/// Phase 2: metadata mutations for one change.
pub struct ChangeContext<'a> {
    scope: &'a UpdateScope,
    user: &'a CurrentUser,
    view: &'a RepoView,
    state: &'a mut ChangeState,
}

impl<'a> ChangeContext<'a> {
    pub(crate) const fn new(
        scope: &'a UpdateScope,
        user: &'a CurrentUser,
        view: &'a RepoView,
        state: &'a mut ChangeState,
    ) -> Self {
        Self {
            scope,
            user,
            view,
            state,
        }
    }

    /// The change as loaded (or as created by its insert op).
    #[must_use]
    pub fn change(&self) -> &Change {
        &self.state.change
    }

    /// Parsed metadata; `None` for a change being inserted.
    #[must_use]
    pub fn notes(&self) -> Option<&ChangeNotes> {
        self.state.notes.as_ref()
    }

    /// `true` if this update creates the change.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.is_new
    }

    /// The update for `patch_set` authored by the current user, created on
    /// first use. Repeated calls return the same update.
    pub fn update(&mut self, patch_set: u32) -> &mut ChangeUpdate {
        let id = self.state.change.id;
        let author = self.user.account().cloned();
        let when = self.scope.when;
        self.state
            .default_updates
            .entry(patch_set)
            .or_insert_with(|| ChangeUpdate::new(id, patch_set, author, when))
    }

    /// A fresh update for `patch_set` that is always written as its own
    /// metadata commit.
    pub fn distinct_update(&mut self, patch_set: u32) -> &mut ChangeUpdate {
        let update = ChangeUpdate::new(
            self.state.change.id,
            patch_set,
            self.user.account().cloned(),
            self.state.when,
        );
        let idx = self.state.distinct_updates.len();
        self.state.distinct_updates.push(update);
        &mut self.state.distinct_updates[idx]
    }

    /// Delete the change: its metadata ref and its drafts are removed
    /// instead of any staged update being written.
    pub fn delete_change(&mut self) {
        self.state.deleted = true;
    }

    /// The repository with phase-1 commands applied.
    #[must_use]
    pub const fn repo_view(&self) -> &RepoView {
        self.view
    }
}

impl_context!(ChangeContext);

// ---------------------------------------------------------------------------
// PostUpdateContext
// ---------------------------------------------------------------------------

/// Phase 3: side effects after every write and reindex finished.
pub struct PostUpdateContext<'a> {
    scope: &'a UpdateScope,
    user: &'a CurrentUser,
    view: &'a RepoView,
    change_data: &'a Arc<BTreeMap<ChangeId, ChangeData>>,
    scheduled: &'a mut Vec<Arc<dyn AsyncPostUpdateOp>>,
}

impl<'a> PostUpdateContext<'a> {
    pub(crate) const fn new(
        scope: &'a UpdateScope,
        user: &'a CurrentUser,
        view: &'a RepoView,
        change_data: &'a Arc<BTreeMap<ChangeId, ChangeData>>,
        scheduled: &'a mut Vec<Arc<dyn AsyncPostUpdateOp>>,
    ) -> Self {
        Self {
            scope,
            user,
            view,
            change_data,
            scheduled,
        }
    }

    /// Data of a change this update wrote or deleted.
    #[must_use]
    pub fn change_data(&self, id: ChangeId) -> Option<&ChangeData> {
        self.change_data.get(&id)
    }

    /// Run `op` on the background pool after every `post_update` returned.
    pub fn schedule_async(&mut self, op: Arc<dyn AsyncPostUpdateOp>) {
        self.scheduled.push(op);
    }

    /// The repository after the update.
    #[must_use]
    pub const fn repo_view(&self) -> &RepoView {
        self.view
    }
}

impl_context!(PostUpdateContext);

// ---------------------------------------------------------------------------
// AsyncContext
// ---------------------------------------------------------------------------

/// Owned context for background post-update work.
#[derive(Clone, Debug)]
pub struct AsyncContext {
    scope: UpdateScope,
    user: CurrentUser,
    change_data: Arc<BTreeMap<ChangeId, ChangeData>>,
}

impl AsyncContext {
    pub(crate) const fn new(
        scope: UpdateScope,
        user: CurrentUser,
        change_data: Arc<BTreeMap<ChangeId, ChangeData>>,
    ) -> Self {
        Self {
            scope,
            user,
            change_data,
        }
    }

    /// Data of a change the update wrote or deleted.
    #[must_use]
    pub fn change_data(&self, id: ChangeId) -> Option<&ChangeData> {
        self.change_data.get(&id)
    }
}

impl Context for AsyncContext {
    fn project(&self) -> &ProjectName {
        &self.scope.project
    }

    fn user(&self) -> &CurrentUser {
        &self.user
    }

    fn when(&self) -> SystemTime {
        self.scope.when
    }

    fn notify(&self, change: ChangeId) -> NotifyHandling {
        self.scope.notify_for(change)
    }
}
