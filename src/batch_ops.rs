//! Incremental batch building for large fan-out updates.
//!
//! Each `add_*_batch` call runs the given ops' repository and change phases
//! right away against a fork of the executor's view. Only if every op
//! succeeds does the fork replace the view, so a failed add leaves nothing
//! behind and the caller may keep adding. Callers watch
//! [`BatchOpsExecutor::refs_in_update`] to chunk their work, then
//! [`execute`](BatchOpsExecutor::execute) and
//! [`clear`](BatchOpsExecutor::clear) to start the next chunk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use refbatch_git::ProjectName;

use crate::batch_update::{BatchUpdateFactory, ChangeResult, Registered, update_one_change};
use crate::change::{ChangeData, ChangeId, CurrentUser};
use crate::context::{AsyncContext, PostUpdateContext, RepoContext, UpdateScope};
use crate::error::UpdateError;
use crate::index::IndexFuture;
use crate::op::{AsyncPostUpdateOp, BatchUpdateOp, OpSlot, RepoOnlyOp};
use crate::ref_update::{BatchRefUpdate, DEFAULT_REF_LOG_MESSAGE, ReceiveCommand};
use crate::repo_view::RepoView;
use crate::update_manager::{SharedRepo, WriteOptions};

/// Accumulates ops chunk by chunk and executes each chunk as one ref batch.
pub struct BatchOpsExecutor {
    factory: BatchUpdateFactory,
    scope: UpdateScope,
    user: CurrentUser,
    atomic: bool,
    view: Option<RepoView>,
    shared: Option<RepoView>,
    ops: Vec<Registered>,
    next_seq: usize,
    results: BTreeMap<ChangeId, ChangeResult>,
    change_data: BTreeMap<ChangeId, ChangeData>,
    batch: Option<BatchRefUpdate>,
    executed: bool,
}

impl std::fmt::Debug for BatchOpsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOpsExecutor")
            .field("project", &self.scope.project)
            .field("atomic", &self.atomic)
            .field("changes", &self.results.len())
            .field("refs_in_update", &self.refs_in_update())
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

impl BatchOpsExecutor {
    /// An atomic executor for `project`.
    ///
    /// # Errors
    /// `Storage` if the project cannot be opened.
    pub fn new(
        factory: &BatchUpdateFactory,
        project: ProjectName,
        user: CurrentUser,
        when: SystemTime,
    ) -> Result<Self, UpdateError> {
        let view = RepoView::open(factory.store().as_ref(), &project)?;
        Ok(Self {
            factory: factory.clone(),
            scope: UpdateScope::new(project, when),
            user,
            atomic: true,
            view: Some(view),
            shared: None,
            ops: Vec::new(),
            next_seq: 0,
            results: BTreeMap::new(),
            change_data: BTreeMap::new(),
            batch: None,
            executed: false,
        })
    }

    /// Execute commands one by one. A non-atomic batch may touch at most
    /// one ref per change.
    pub const fn set_non_atomic(&mut self) -> &mut Self {
        self.atomic = false;
        self
    }

    /// Ceiling callers should chunk `refs_in_update` against.
    #[must_use]
    pub fn max_refs_per_batch(&self) -> usize {
        self.factory.config().update.max_refs_per_batch
    }

    /// `true` once executed, until cleared.
    #[must_use]
    pub const fn is_executed(&self) -> bool {
        self.executed
    }

    /// Refs the current chunk moves (or moved, once executed). Draft refs
    /// in the shared repository are not counted.
    #[must_use]
    pub fn refs_in_update(&self) -> usize {
        match (&self.batch, &self.view) {
            (Some(batch), _) => batch.commands().len(),
            (None, Some(view)) => view.pending_ref_count(),
            (None, None) => 0,
        }
    }

    /// Executed commands by ref name; empty before execution.
    #[must_use]
    pub fn get_ref_updates(&self) -> BTreeMap<String, ReceiveCommand> {
        self.batch
            .iter()
            .flat_map(BatchRefUpdate::commands)
            .map(|c| (c.ref_name().to_owned(), c.clone()))
            .collect()
    }

    /// What a change's ops did, once added.
    #[must_use]
    pub fn change_result(&self, change: ChangeId) -> Option<ChangeResult> {
        self.results.get(&change).copied()
    }

    fn check_not_executed(&self) -> Result<(), UpdateError> {
        if self.executed {
            return Err(UpdateError::usage("update already executed"));
        }
        Ok(())
    }

    fn view(&self) -> Result<&RepoView, UpdateError> {
        self.view
            .as_ref()
            .ok_or_else(|| UpdateError::usage("repository view closed"))
    }

    fn register(&mut self, op: OpSlot) -> Registered {
        let reg = Registered::new(self.next_seq, self.user.clone(), op);
        self.next_seq += 1;
        reg
    }

    /// Apply a repository-only op to the chunk.
    ///
    /// # Errors
    /// `Usage` once executed; the op's mapped error, with nothing staged.
    pub fn add_repo_only_op_batch(
        &mut self,
        op: impl RepoOnlyOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        self.check_not_executed()?;
        let mut reg = self.register(OpSlot::Repo(Box::new(op)));
        let mut shadow = self.view()?.fork();
        {
            let mut ctx = RepoContext::new(&self.scope, &reg.user, &mut shadow);
            reg.op.update_repo(&mut ctx)?;
        }
        self.view = Some(shadow);
        self.ops.push(reg);
        Ok(self)
    }

    /// Apply one op for `change` to the chunk.
    ///
    /// # Errors
    /// See [`add_ops_batch`](Self::add_ops_batch).
    pub fn add_op_batch(
        &mut self,
        change: ChangeId,
        op: impl BatchUpdateOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        self.add_ops_batch(change, vec![Box::new(op)])
    }

    /// Apply every op for `change` to the chunk: repository phase, change
    /// phase, and metadata staging.
    ///
    /// # Errors
    /// - `Usage` once executed, or if ops for `change` were already added.
    /// - `NotFound` if the change does not exist.
    /// - Any op's mapped error. Nothing of `ops` is staged then.
    pub fn add_ops_batch(
        &mut self,
        change: ChangeId,
        ops: Vec<Box<dyn BatchUpdateOp>>,
    ) -> Result<&mut Self, UpdateError> {
        self.check_not_executed()?;
        if self.results.contains_key(&change) {
            return Err(UpdateError::usage(format!(
                "ops for change {change} already added to this batch"
            )));
        }
        let mut regs: Vec<Registered> = ops
            .into_iter()
            .map(|op| self.register(OpSlot::Change(op)))
            .collect();

        let factory = self.factory.clone();
        let backend = factory.backend().as_ref();
        let mut shadow = self.view()?.fork();
        for reg in &mut regs {
            let mut ctx = RepoContext::new(&self.scope, &reg.user, &mut shadow);
            reg.op.update_repo(&mut ctx)?;
        }
        let outcome = update_one_change(&self.scope, &shadow, backend, change, &mut regs, None)?;

        let mut shared = SharedRepo::resume(
            factory.store().as_ref(),
            factory.shared_project().clone(),
            self.shared.as_ref().map(RepoView::fork),
        );
        let meta_id = match &outcome.pending {
            Some(pending) => {
                let mut pending = pending.clone();
                pending.updates.sort_by_key(crate::notes::ChangeUpdate::patch_set);
                backend.stage(&pending, &mut shadow, &mut shared)?
            }
            None => None,
        };

        self.view = Some(shadow);
        if let Some(shared_view) = shared.into_view() {
            self.shared = Some(shared_view);
        }
        self.results.insert(change, outcome.result);
        match outcome.result {
            ChangeResult::Skipped => {}
            ChangeResult::Upserted => {
                self.change_data.insert(
                    change,
                    ChangeData {
                        change: outcome.after,
                        meta_id,
                    },
                );
            }
            ChangeResult::Deleted => {
                self.change_data.insert(
                    change,
                    ChangeData {
                        change: outcome.before,
                        meta_id: None,
                    },
                );
            }
        }
        self.ops.extend(regs);
        tracing::debug!(%change, result = ?outcome.result, refs = self.refs_in_update(), "ops added to batch");
        Ok(self)
    }

    /// Execute the chunk: write its refs, reindex, then run every op's
    /// `post_update`. The executed commands stay visible through
    /// [`get_ref_updates`](Self::get_ref_updates) until cleared, even if
    /// the write failed.
    ///
    /// # Errors
    /// - `Usage` if already executed or a non-atomic batch touches two refs
    ///   of one change.
    /// - `LockFailure` or `RefUpdateRejected` from the ref write.
    /// - Reindex and `post_update` failures.
    #[tracing::instrument(skip_all, fields(project = %self.scope.project, atomic = self.atomic))]
    pub fn execute(&mut self) -> Result<(), UpdateError> {
        self.check_not_executed()?;
        self.executed = true;
        let factory = self.factory.clone();

        let opts = WriteOptions {
            atomic: self.atomic,
            ref_log_message: None,
            ref_log_ident: Some(
                self.user
                    .account()
                    .map_or_else(|| factory.server_ident().clone(), crate::change::Account::ident),
            ),
            push_certificate: None,
        };
        let Some(view) = self.view.as_mut() else {
            return Err(UpdateError::usage("repository view closed"));
        };
        let mut batch = opts.new_batch(DEFAULT_REF_LOG_MESSAGE);
        view.drain_into(&mut batch);
        let outcome = if batch.is_empty() {
            Ok(())
        } else {
            factory.backend().write(view, &mut batch)
        };
        let executed_refs = !batch.is_empty();
        self.batch = Some(batch);
        outcome?;

        if let Some(shared) = self.shared.as_mut() {
            let mut shared_batch = opts.new_batch(DEFAULT_REF_LOG_MESSAGE);
            shared.drain_into(&mut shared_batch);
            if !shared_batch.is_empty() {
                match factory.backend().write(shared, &mut shared_batch) {
                    Ok(()) => {}
                    Err(e) if factory.config().update.ignore_shared_write_failures => {
                        tracing::warn!(error = %e, "ignoring failed write to shared repository");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if executed_refs {
            if let Some(batch) = &self.batch {
                factory
                    .notifier()
                    .fire(&self.scope.project, batch, self.user.account());
            }
        }

        let mut futures: Vec<IndexFuture> = Vec::new();
        for (id, result) in &self.results {
            match result {
                ChangeResult::Skipped => {}
                ChangeResult::Upserted => {
                    futures.push(factory.indexer().index_async(&self.scope.project, *id));
                }
                ChangeResult::Deleted => {
                    futures.push(factory.indexer().delete_async(&self.scope.project, *id));
                }
            }
        }
        for future in futures {
            future.wait()?;
        }

        self.run_post_ops(&factory)
    }

    fn run_post_ops(&mut self, factory: &BatchUpdateFactory) -> Result<(), UpdateError> {
        let change_data = Arc::new(self.change_data.clone());
        let mut scheduled: Vec<Arc<dyn AsyncPostUpdateOp>> = Vec::new();
        let Some(view) = self.view.as_ref() else {
            return Err(UpdateError::usage("repository view closed"));
        };
        for reg in &mut self.ops {
            let mut ctx =
                PostUpdateContext::new(&self.scope, &reg.user, view, &change_data, &mut scheduled);
            reg.op.post_update(&mut ctx)?;
        }
        for op in scheduled {
            let ctx = AsyncContext::new(
                self.scope.clone(),
                self.user.clone(),
                Arc::clone(&change_data),
            );
            let submitted = factory.async_pool().submit(move || {
                if let Err(e) = op.async_post_update(&ctx) {
                    tracing::warn!(error = %e, "async post-update op failed");
                }
            });
            if let Err(e) = submitted {
                tracing::warn!(error = %e, "could not schedule async post-update op");
            }
        }
        Ok(())
    }

    /// Drop the chunk, executed or not, so the executor can take the next.
    pub fn clear(&mut self) {
        if let Some(view) = self.view.as_mut() {
            view.clear_commands();
        }
        if let Some(shared) = self.shared.take() {
            shared.close();
        }
        self.ops.clear();
        self.results.clear();
        self.change_data.clear();
        self.batch = None;
        self.executed = false;
    }

    /// Release the repository handles.
    pub fn close(mut self) {
        self.clear();
        if let Some(view) = self.view.take() {
            view.close();
        }
    }
}

impl Drop for BatchOpsExecutor {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.close();
        }
        if let Some(view) = self.view.take() {
            view.close();
        }
    }
}
