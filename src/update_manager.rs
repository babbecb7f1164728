//! Staging and writing of change metadata.
//!
//! [`UpdateManager`] collects the updates of every dirty change, turns them
//! into metadata commits through a [`DurabilityBackend`], and executes the
//! resulting ref commands: the change repository first, the shared
//! repository (draft comments) second.

use std::collections::BTreeMap;

use refbatch_git::{GitError, GitOid, PersonIdent, ProjectName, RepositoryStore};

use crate::change::{AccountId, ChangeId, DraftComment};
use crate::error::UpdateError;
use crate::notes::{ChangeNotes, ChangeUpdate, read_drafts, write_drafts};
use crate::ref_update::{BatchRefUpdate, ReceiveCommand};
use crate::repo_view::RepoView;

/// Reflog message for metadata batches when the caller set none.
pub const DEFAULT_META_REF_LOG_MESSAGE: &str = "Update NoteDb refs";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The staged work of one change after phase 2.
#[derive(Clone, Debug)]
pub struct PendingChange {
    /// Change written.
    pub id: ChangeId,
    /// Updates in staging order; the manager sorts them by patch set.
    pub updates: Vec<ChangeUpdate>,
    /// Delete the change instead of writing `updates`.
    pub deleted: bool,
}

/// Settings applied to every executed batch.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// One transaction per repository, or command by command.
    pub atomic: bool,
    /// Reflog message override.
    pub ref_log_message: Option<String>,
    /// Reflog identity.
    pub ref_log_ident: Option<PersonIdent>,
    /// Signed push certificate.
    pub push_certificate: Option<String>,
}

impl WriteOptions {
    /// A batch configured from these options.
    #[must_use]
    pub fn new_batch(&self, default_message: &str) -> BatchRefUpdate {
        let mut batch = BatchRefUpdate::new();
        batch
            .set_atomic(self.atomic)
            .set_allow_non_fast_forwards(true)
            .set_ref_log_message(Some(
                self.ref_log_message
                    .clone()
                    .unwrap_or_else(|| default_message.to_owned()),
            ))
            .set_ref_log_ident(self.ref_log_ident.clone())
            .set_push_certificate(self.push_certificate.clone());
        batch
    }
}

// ---------------------------------------------------------------------------
// Shared repository
// ---------------------------------------------------------------------------

/// The shared repository, opened on first use.
pub struct SharedRepo<'a> {
    store: &'a dyn RepositoryStore,
    project: ProjectName,
    view: Option<RepoView>,
}

impl<'a> SharedRepo<'a> {
    /// Not yet opened.
    #[must_use]
    pub const fn new(store: &'a dyn RepositoryStore, project: ProjectName) -> Self {
        Self {
            store,
            project,
            view: None,
        }
    }

    /// The view, opening it if needed.
    ///
    /// # Errors
    /// `Storage` if the shared project cannot be opened.
    pub fn view(&mut self) -> Result<&mut RepoView, UpdateError> {
        let view = match self.view.take() {
            Some(v) => v,
            None => RepoView::open(self.store, &self.project)?,
        };
        Ok(self.view.insert(view))
    }

    /// Continue with a view opened earlier, as `into_view` returned it.
    pub(crate) const fn resume(
        store: &'a dyn RepositoryStore,
        project: ProjectName,
        view: Option<RepoView>,
    ) -> Self {
        Self {
            store,
            project,
            view,
        }
    }

    /// The view, if it was opened; its staged commands are kept.
    pub(crate) fn into_view(self) -> Option<RepoView> {
        self.view
    }

    fn opened(&mut self) -> Option<&mut RepoView> {
        self.view.as_mut()
    }

    fn close(self) {
        if let Some(view) = self.view {
            view.close();
        }
    }
}

// ---------------------------------------------------------------------------
// DurabilityBackend
// ---------------------------------------------------------------------------

/// How change metadata is staged, written, and read back.
pub trait DurabilityBackend: Send + Sync {
    /// Stage `change`'s commits and ref commands into `view` and `shared`.
    /// Returns the metadata tip after the write, `None` once deleted.
    ///
    /// # Errors
    /// `Conflict` if an update's preconditions on the metadata ref fail;
    /// `Storage` on object write failures.
    fn stage(
        &self,
        change: &PendingChange,
        view: &mut RepoView,
        shared: &mut SharedRepo<'_>,
    ) -> Result<Option<GitOid>, UpdateError>;

    /// Execute `batch` against the repository behind `view`.
    ///
    /// # Errors
    /// Whatever [`BatchRefUpdate::execute`] reports.
    fn write(&self, view: &RepoView, batch: &mut BatchRefUpdate) -> Result<(), UpdateError> {
        batch.execute(view.repository())
    }

    /// Load a change as currently visible through `view`.
    ///
    /// # Errors
    /// `Storage` or `Other` if the metadata cannot be read or parsed.
    fn read_back(&self, view: &RepoView, id: ChangeId) -> Result<Option<ChangeNotes>, UpdateError>;
}

/// Metadata as a chain of commits on `refs/changes/NN/ID/meta`, drafts as
/// JSON blobs on `refs/draft-comments/NN/ID/ACCOUNT` in the shared
/// repository.
#[derive(Clone, Debug)]
pub struct NoteDbBackend {
    server_ident: PersonIdent,
}

impl NoteDbBackend {
    /// Commits without an author are written as `server_ident`.
    #[must_use]
    pub const fn new(server_ident: PersonIdent) -> Self {
        Self { server_ident }
    }

    fn stage_delete(
        id: ChangeId,
        view: &mut RepoView,
        shared: &mut SharedRepo<'_>,
    ) -> Result<Option<GitOid>, UpdateError> {
        let meta_ref = id.meta_ref();
        if let Some(old) = view.get_ref(&meta_ref)? {
            view.add_command(ReceiveCommand::delete(meta_ref, old))?;
        }
        let shared_view = match shared.view() {
            Ok(v) => v,
            Err(UpdateError::Storage(GitError::NotFound { .. })) => {
                tracing::debug!(change = %id, "no shared repository; skipping draft deletion");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        for (name, old) in shared_view.get_refs(&id.draft_comments_prefix())? {
            shared_view.add_command(ReceiveCommand::delete(name, old))?;
        }
        Ok(None)
    }

    fn stage_drafts(
        &self,
        id: ChangeId,
        update: &ChangeUpdate,
        shared: &mut SharedRepo<'_>,
    ) -> Result<(), UpdateError> {
        let mut by_author: BTreeMap<AccountId, Vec<DraftComment>> = BTreeMap::new();
        for draft in update.drafts() {
            by_author.entry(draft.author).or_default().push(draft.clone());
        }
        if by_author.is_empty() {
            return Ok(());
        }
        let shared_view = shared.view()?;
        for (account, drafts) in by_author {
            let draft_ref = id.draft_comments_ref(account);
            let tip = shared_view.get_ref(&draft_ref)?;
            let mut all = match tip {
                Some(tip) => read_drafts(shared_view.repository(), tip)?,
                None => Vec::new(),
            };
            all.extend(drafts);
            let ident = update
                .author()
                .filter(|a| a.id == account)
                .map_or_else(|| self.server_ident.clone(), crate::change::Account::ident);
            let new = write_drafts(shared_view.repository(), tip, Some(&ident), &all)?;
            shared_view.add_command(ReceiveCommand::new(
                draft_ref,
                tip.unwrap_or(GitOid::ZERO),
                new,
            ))?;
        }
        Ok(())
    }
}

impl DurabilityBackend for NoteDbBackend {
    fn stage(
        &self,
        change: &PendingChange,
        view: &mut RepoView,
        shared: &mut SharedRepo<'_>,
    ) -> Result<Option<GitOid>, UpdateError> {
        let id = change.id;
        if change.deleted {
            return Self::stage_delete(id, view, shared);
        }

        let meta_ref = id.meta_ref();
        let old = view.get_ref(&meta_ref)?;
        let mut allow_write = old.is_some();
        let mut tip = old;
        let mut empty_tree = None;

        for (i, update) in change.updates.iter().enumerate() {
            if i == 0 && update.allows_write_to_new_ref() {
                allow_write = true;
            }
            if update.is_root_only() && old.is_some() {
                return Err(UpdateError::Conflict(format!("change {id} already exists")));
            }
            if !allow_write {
                return Err(UpdateError::Conflict(format!(
                    "change {id} has no metadata to update"
                )));
            }
            self.stage_drafts(id, update, shared)?;
            if update.is_empty() {
                continue;
            }
            let tree = match empty_tree {
                Some(t) => t,
                None => *empty_tree.insert(view.inserter().insert_tree(&[])?),
            };
            let parents: Vec<GitOid> = tip.into_iter().collect();
            let author = update.author().map_or_else(|| self.server_ident.clone(), crate::change::Account::ident);
            let commit = view.inserter().insert_commit(
                tree,
                &parents,
                &update.commit_message(),
                Some(&author),
            )?;
            tip = Some(commit);
        }

        if let Some(new) = tip
            && tip != old
        {
            view.add_command(ReceiveCommand::new(
                meta_ref,
                old.unwrap_or(GitOid::ZERO),
                new,
            ))?;
        }
        Ok(tip)
    }

    fn read_back(&self, view: &RepoView, id: ChangeId) -> Result<Option<ChangeNotes>, UpdateError> {
        match view.get_ref(&id.meta_ref())? {
            Some(tip) => ChangeNotes::load_at(view.repository(), view.project(), id, tip).map(Some),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateManager
// ---------------------------------------------------------------------------

/// Result of staging every change of a batch.
#[derive(Debug, Default)]
pub struct ExecutedWrites {
    /// Batch executed (or prepared, in a dry run) on the change repository.
    pub batch: Option<BatchRefUpdate>,
    /// Metadata tip per staged change after the write.
    pub meta_ids: BTreeMap<ChangeId, Option<GitOid>>,
}

/// Stages change metadata and executes it.
pub struct UpdateManager<'a> {
    backend: &'a dyn DurabilityBackend,
    shared: SharedRepo<'a>,
    ignore_shared_failures: bool,
    meta_ids: BTreeMap<ChangeId, Option<GitOid>>,
}

impl<'a> UpdateManager<'a> {
    /// A manager writing shared data to `shared_project` in `store`.
    #[must_use]
    pub const fn new(
        backend: &'a dyn DurabilityBackend,
        store: &'a dyn RepositoryStore,
        shared_project: ProjectName,
        ignore_shared_failures: bool,
    ) -> Self {
        Self {
            backend,
            shared: SharedRepo::new(store, shared_project),
            ignore_shared_failures,
            meta_ids: BTreeMap::new(),
        }
    }

    /// Stage `change` into `view`. Updates are applied in increasing
    /// patch-set order; updates of one patch set keep their staging order.
    ///
    /// # Errors
    /// Whatever the backend reports while staging.
    pub fn add(&mut self, view: &mut RepoView, mut change: PendingChange) -> Result<(), UpdateError> {
        change.updates.sort_by_key(ChangeUpdate::patch_set);
        let tip = self.backend.stage(&change, view, &mut self.shared)?;
        self.meta_ids.insert(change.id, tip);
        Ok(())
    }

    /// Execute everything staged in `view`, then the shared repository.
    /// In a dry run the batch is built but not executed.
    ///
    /// # Errors
    /// Failures of the change repository batch. A failed shared batch is
    /// logged and dropped when configured to be ignored.
    pub fn execute(
        mut self,
        view: &mut RepoView,
        opts: &WriteOptions,
        dryrun: bool,
    ) -> Result<ExecutedWrites, UpdateError> {
        let mut batch = opts.new_batch(DEFAULT_META_REF_LOG_MESSAGE);
        view.drain_into(&mut batch);
        let has_change_batch = !batch.is_empty();
        if has_change_batch && !dryrun {
            self.backend.write(view, &mut batch)?;
        }

        if let Some(shared_view) = self.shared.opened() {
            let mut shared_batch = opts.new_batch(DEFAULT_META_REF_LOG_MESSAGE);
            shared_view.drain_into(&mut shared_batch);
            if !shared_batch.is_empty() && !dryrun {
                match self.backend.write(shared_view, &mut shared_batch) {
                    Ok(()) => {}
                    Err(e) if self.ignore_shared_failures => {
                        tracing::warn!(
                            project = %shared_view.project(),
                            error = %e,
                            "ignoring failed write to shared repository"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.shared.close();

        Ok(ExecutedWrites {
            batch: has_change_batch.then_some(batch),
            meta_ids: self.meta_ids,
        })
    }

    /// Load a change through the backend.
    ///
    /// # Errors
    /// As [`DurabilityBackend::read_back`].
    pub fn read_back(&self, view: &RepoView, id: ChangeId) -> Result<Option<ChangeNotes>, UpdateError> {
        self.backend.read_back(view, id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use refbatch_git::{GitRepo, InMemoryRepositoryStore, MemRepo, RefName};

    use super::*;
    use crate::change::{Account, AccountId, Change, ChangeStatus};

    fn project() -> ProjectName {
        ProjectName::new("p").unwrap()
    }

    fn shared() -> ProjectName {
        ProjectName::new("All-Users").unwrap()
    }

    struct Fixture {
        store: InMemoryRepositoryStore,
        repo: Arc<MemRepo>,
        shared_repo: Arc<MemRepo>,
        backend: NoteDbBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryRepositoryStore::new();
            let repo = store.create_repository(&project()).unwrap();
            let shared_repo = store.create_repository(&shared()).unwrap();
            Self {
                store,
                repo,
                shared_repo,
                backend: NoteDbBackend::new(PersonIdent::new("Server", "server@example.com")),
            }
        }

        fn view(&self) -> RepoView {
            RepoView::open(&self.store, &project()).unwrap()
        }

        fn manager(&self) -> UpdateManager<'_> {
            UpdateManager::new(&self.backend, &self.store, shared(), true)
        }
    }

    fn when(s: u64) -> std::time::SystemTime {
        UNIX_EPOCH + Duration::from_secs(s)
    }

    fn creation(id: u32) -> ChangeUpdate {
        let mut c = Change::new(
            ChangeId::new(id),
            project(),
            "refs/heads/main",
            AccountId::new(1),
            when(1),
        );
        c.subject = "Subject".into();
        ChangeUpdate::for_new_change(&c, None, when(1))
    }

    fn atomic() -> WriteOptions {
        WriteOptions {
            atomic: true,
            ..WriteOptions::default()
        }
    }

    #[test]
    fn updates_written_in_patch_set_order() {
        let fx = Fixture::new();
        let id = ChangeId::new(3);
        let mut ps2 = ChangeUpdate::new(id, 2, None, when(5));
        ps2.set_change_message("second");
        let mut ps1 = ChangeUpdate::new(id, 1, None, when(4));
        ps1.set_change_message("first");

        let mut view = fx.view();
        let mut mgr = fx.manager();
        mgr.add(
            &mut view,
            PendingChange {
                id,
                updates: vec![creation(3), ps2, ps1],
                deleted: false,
            },
        )
        .unwrap();
        let writes = mgr.execute(&mut view, &atomic(), false).unwrap();
        assert!(writes.batch.unwrap().is_ok());

        let notes = fx.backend.read_back(&fx.view(), id).unwrap().unwrap();
        assert_eq!(notes.messages, vec!["first".to_owned(), "second".to_owned()]);
        assert_eq!(notes.commit_count, 3);
        assert_eq!(notes.change.status, ChangeStatus::New);
        let reflog = fx.repo.reflog().unwrap();
        assert_eq!(reflog.len(), 1);
        assert_eq!(reflog[0].message, DEFAULT_META_REF_LOG_MESSAGE);
    }

    #[test]
    fn update_without_metadata_ref_is_rejected() {
        let fx = Fixture::new();
        let id = ChangeId::new(4);
        let mut u = ChangeUpdate::new(id, 1, None, when(1));
        u.set_subject("x");
        let mut view = fx.view();
        let err = fx
            .manager()
            .add(
                &mut view,
                PendingChange {
                    id,
                    updates: vec![u],
                    deleted: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, UpdateError::Conflict(_)));
    }

    #[test]
    fn root_only_update_fails_on_existing_change() {
        let fx = Fixture::new();
        let meta = RefName::new(&ChangeId::new(5).meta_ref()).unwrap();
        fx.repo.force_ref(&meta, GitOid::from_bytes([7; 20])).unwrap();
        let mut view = fx.view();
        let err = fx
            .manager()
            .add(
                &mut view,
                PendingChange {
                    id: ChangeId::new(5),
                    updates: vec![creation(5)],
                    deleted: false,
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn drafts_go_to_shared_repository_and_deletion_removes_them() {
        let fx = Fixture::new();
        let id = ChangeId::new(6);
        let alice = Account::new(1000, "Alice", "alice@example.com");
        let mut create = creation(6);
        create.put_draft(DraftComment {
            author: alice.id,
            patch_set: 1,
            file: "a.txt".into(),
            line: 1,
            message: "hm".into(),
        });

        let mut view = fx.view();
        let mut mgr = fx.manager();
        mgr.add(
            &mut view,
            PendingChange {
                id,
                updates: vec![create],
                deleted: false,
            },
        )
        .unwrap();
        mgr.execute(&mut view, &atomic(), false).unwrap();

        let draft_ref = RefName::new(&id.draft_comments_ref(alice.id)).unwrap();
        let tip = fx.shared_repo.read_ref(&draft_ref).unwrap().unwrap();
        assert_eq!(read_drafts(fx.shared_repo.as_ref(), tip).unwrap().len(), 1);
        assert!(fx.repo.refs().unwrap().keys().all(|r| !r.as_str().starts_with("refs/draft-comments/")));

        let mut view = fx.view();
        let mut mgr = fx.manager();
        mgr.add(
            &mut view,
            PendingChange {
                id,
                updates: vec![],
                deleted: true,
            },
        )
        .unwrap();
        let writes = mgr.execute(&mut view, &atomic(), false).unwrap();
        assert_eq!(writes.meta_ids.get(&id), Some(&None));
        assert!(fx.repo.refs().unwrap().is_empty());
        assert!(fx.shared_repo.refs().unwrap().is_empty());
    }

    #[test]
    fn shared_failure_swallowed_after_primary_write() {
        let fx = Fixture::new();
        fx.shared_repo.set_io_failure(true);
        let id = ChangeId::new(8);
        let mut create = creation(8);
        create.put_draft(DraftComment {
            author: AccountId::new(1),
            patch_set: 1,
            file: "f".into(),
            line: 0,
            message: "m".into(),
        });
        let mut view = fx.view();
        let mut mgr = fx.manager();
        mgr.add(
            &mut view,
            PendingChange {
                id,
                updates: vec![create],
                deleted: false,
            },
        )
        .unwrap();
        mgr.execute(&mut view, &atomic(), false).unwrap();
        assert_eq!(fx.repo.refs().unwrap().len(), 1);
        assert!(fx.shared_repo.refs().unwrap().is_empty());
    }

    #[test]
    fn dry_run_writes_no_refs() {
        let fx = Fixture::new();
        let mut view = fx.view();
        let mut mgr = fx.manager();
        mgr.add(
            &mut view,
            PendingChange {
                id: ChangeId::new(9),
                updates: vec![creation(9)],
                deleted: false,
            },
        )
        .unwrap();
        let writes = mgr.execute(&mut view, &atomic(), true).unwrap();
        let batch = writes.batch.unwrap();
        assert!(!batch.is_executed());
        assert_eq!(batch.successfully_updated(true).len(), 1);
        assert!(fx.repo.refs().unwrap().is_empty());
    }
}
