//! The batch update orchestrator.
//!
//! A [`BatchUpdate`] collects operations for one project and runs them in
//! three phases:
//!
//! 1. **update repo**: every op's `update_repo`, in registration order.
//!    Staged commands are validated, then objects are flushed once.
//! 2. **update changes**: for each change (first-registration order) every
//!    op's `update_change`. Dirty changes get their metadata staged, then the
//!    queued ref commands are executed. Changes are reindexed.
//! 3. **post update**: ref-update events fire, every op's `post_update` runs
//!    in registration order, then async ops are handed to the background
//!    pool.
//!
//! [`BatchUpdate::execute_all`] runs several updates (one per project) as
//! one submission, with a barrier between phases.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crossbeam::channel::{bounded, unbounded};
use refbatch_git::{PersonIdent, ProjectName, RepositoryStore};
use tracing::instrument;

use crate::change::{Account, Change, ChangeData, ChangeId, CurrentUser, NotifyHandling};
use crate::config::RefbatchConfig;
use crate::context::{
    AsyncContext, BaseContext, ChangeContext, ChangeState, PostUpdateContext, RepoContext,
    UpdateScope,
};
use crate::error::{OpError, UpdateError};
use crate::index::{IndexFuture, Indexer, NoopIndexer};
use crate::listener::BatchUpdateListener;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::notify::{NoopNotifier, ReferenceUpdateNotifier};
use crate::op::{AsyncPostUpdateOp, BatchUpdateOp, InsertChangeOp, OpSlot, RepoOnlyOp};
use crate::pool::WorkerPool;
use crate::ref_update::{BatchRefUpdate, DEFAULT_REF_LOG_MESSAGE, ReceiveCommand};
use crate::repo_view::RepoView;
use crate::update_manager::{
    DurabilityBackend, NoteDbBackend, PendingChange, UpdateManager, WriteOptions,
};
use crate::validators::OnSubmitValidators;

// ---------------------------------------------------------------------------
// Public enums
// ---------------------------------------------------------------------------

/// Order of the repository and change phases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Order {
    /// Repository ops and refs first, then change metadata.
    #[default]
    RepoBeforeDb,
    /// Change metadata first, then repository ops and refs. Used by
    /// deletion flows.
    DbBeforeRepo,
}

/// What phase 2 did to a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeResult {
    /// No op reported the change dirty; nothing written.
    Skipped,
    /// Metadata written; the change is reindexed.
    Upserted,
    /// Change deleted; removed from the index.
    Deleted,
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

struct Env {
    store: Arc<dyn RepositoryStore>,
    indexer: Arc<dyn Indexer>,
    notifier: Arc<dyn ReferenceUpdateNotifier>,
    metrics: Arc<dyn MetricsSink>,
    backend: Arc<dyn DurabilityBackend>,
    config: RefbatchConfig,
    server_ident: PersonIdent,
    shared_project: ProjectName,
    async_pool: WorkerPool,
}

/// Creates [`BatchUpdate`]s sharing one set of collaborators.
#[derive(Clone)]
pub struct BatchUpdateFactory {
    env: Arc<Env>,
}

impl std::fmt::Debug for BatchUpdateFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUpdateFactory")
            .field("config", &self.env.config)
            .field("server_ident", &self.env.server_ident)
            .finish_non_exhaustive()
    }
}

impl BatchUpdateFactory {
    /// Start configuring a factory over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn RepositoryStore>) -> BatchUpdateFactoryBuilder {
        BatchUpdateFactoryBuilder {
            store,
            indexer: Arc::new(NoopIndexer),
            notifier: Arc::new(NoopNotifier),
            metrics: Arc::new(NoopMetrics),
            backend: None,
            config: RefbatchConfig::default(),
            server_ident: PersonIdent::new("Refbatch Server", "server@refbatch.invalid"),
        }
    }

    /// A new, empty update of `project` on behalf of `user` at `when`.
    #[must_use]
    pub fn create(&self, project: ProjectName, user: CurrentUser, when: SystemTime) -> BatchUpdate {
        BatchUpdate::new(Arc::clone(&self.env), project, user, when)
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &RefbatchConfig {
        &self.env.config
    }

    /// Metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.env.metrics
    }

    /// Repository store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RepositoryStore> {
        &self.env.store
    }

    /// Durability backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DurabilityBackend> {
        &self.env.backend
    }

    /// Identity of server-authored writes.
    #[must_use]
    pub fn server_ident(&self) -> &PersonIdent {
        &self.env.server_ident
    }

    pub(crate) fn shared_project(&self) -> &ProjectName {
        &self.env.shared_project
    }

    pub(crate) fn indexer(&self) -> &Arc<dyn Indexer> {
        &self.env.indexer
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn ReferenceUpdateNotifier> {
        &self.env.notifier
    }

    pub(crate) fn async_pool(&self) -> &WorkerPool {
        &self.env.async_pool
    }
}

/// Builder for [`BatchUpdateFactory`]. Unset collaborators are no-ops.
pub struct BatchUpdateFactoryBuilder {
    store: Arc<dyn RepositoryStore>,
    indexer: Arc<dyn Indexer>,
    notifier: Arc<dyn ReferenceUpdateNotifier>,
    metrics: Arc<dyn MetricsSink>,
    backend: Option<Arc<dyn DurabilityBackend>>,
    config: RefbatchConfig,
    server_ident: PersonIdent,
}

impl BatchUpdateFactoryBuilder {
    /// Index to keep in sync.
    #[must_use]
    pub fn indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = indexer;
        self
    }

    /// Receiver of ref-update events.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn ReferenceUpdateNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Durability backend; defaults to [`NoteDbBackend`].
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn DurabilityBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Configuration.
    #[must_use]
    pub fn config(mut self, config: RefbatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity of server-authored commits and reflog entries.
    #[must_use]
    pub fn server_ident(mut self, ident: PersonIdent) -> Self {
        self.server_ident = ident;
        self
    }

    /// Build the factory and start its background pool.
    ///
    /// # Errors
    /// `BadRequest` for an invalid shared project name; `Other` if the
    /// background pool cannot start.
    pub fn build(self) -> Result<BatchUpdateFactory, UpdateError> {
        let shared_project = ProjectName::new(&self.config.update.shared_project)
            .map_err(|e| UpdateError::BadRequest(e.to_string()))?;
        let threads = self.config.update.async_post_update_threads;
        let async_pool = WorkerPool::new("async-post-update", threads, threads.max(1) * 64)?;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(NoteDbBackend::new(self.server_ident.clone())));
        Ok(BatchUpdateFactory {
            env: Arc::new(Env {
                store: self.store,
                indexer: self.indexer,
                notifier: self.notifier,
                metrics: self.metrics,
                backend,
                config: self.config,
                server_ident: self.server_ident,
                shared_project,
                async_pool,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// BatchUpdate
// ---------------------------------------------------------------------------

pub(crate) struct Registered {
    seq: usize,
    pub(crate) user: CurrentUser,
    pub(crate) op: OpSlot,
}

impl Registered {
    pub(crate) const fn new(seq: usize, user: CurrentUser, op: OpSlot) -> Self {
        Self { seq, user, op }
    }
}

/// One project's update: registered ops plus the state of their execution.
pub struct BatchUpdate {
    env: Arc<Env>,
    scope: UpdateScope,
    user: CurrentUser,
    order: Order,
    parallel: bool,
    validators: OnSubmitValidators,
    ref_log_message: Option<String>,
    push_certificate: Option<String>,

    next_seq: usize,
    repo_ops: Vec<Registered>,
    change_ops: HashMap<ChangeId, Vec<Registered>>,
    change_order: Vec<ChangeId>,
    new_changes: HashMap<ChangeId, Change>,
    async_ops: Vec<Arc<dyn AsyncPostUpdateOp>>,

    view: Option<RepoView>,
    repo_batch: Option<BatchRefUpdate>,
    change_batch: Option<BatchRefUpdate>,
    results: BTreeMap<ChangeId, ChangeResult>,
    change_data: BTreeMap<ChangeId, ChangeData>,
    index_futures: Vec<(ChangeId, IndexFuture)>,
    executed: bool,
}

impl std::fmt::Debug for BatchUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUpdate")
            .field("project", &self.scope.project)
            .field("user", &self.user)
            .field("order", &self.order)
            .field("changes", &self.change_order)
            .field("repo_ops", &self.repo_ops.len())
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

impl BatchUpdate {
    fn new(env: Arc<Env>, project: ProjectName, user: CurrentUser, when: SystemTime) -> Self {
        Self {
            env,
            scope: UpdateScope::new(project, when),
            user,
            order: Order::default(),
            parallel: false,
            validators: OnSubmitValidators::default(),
            ref_log_message: None,
            push_certificate: None,
            next_seq: 0,
            repo_ops: Vec::new(),
            change_ops: HashMap::new(),
            change_order: Vec::new(),
            new_changes: HashMap::new(),
            async_ops: Vec::new(),
            view: None,
            repo_batch: None,
            change_batch: None,
            results: BTreeMap::new(),
            change_data: BTreeMap::new(),
            index_futures: Vec::new(),
            executed: false,
        }
    }

    // -- configuration --

    /// Project this update writes to.
    #[must_use]
    pub const fn project(&self) -> &ProjectName {
        &self.scope.project
    }

    /// User the update runs as by default.
    #[must_use]
    pub const fn user(&self) -> &CurrentUser {
        &self.user
    }

    /// Phase order.
    pub const fn set_order(&mut self, order: Order) -> &mut Self {
        self.order = order;
        self
    }

    /// Run `update_change` for different changes on the bounded pool.
    pub const fn update_changes_in_parallel(&mut self) -> &mut Self {
        self.parallel = true;
        self
    }

    /// Default notification setting.
    pub const fn set_notify(&mut self, notify: NotifyHandling) -> &mut Self {
        self.scope.notify = notify;
        self
    }

    /// Notification setting for one change, overriding the default.
    pub fn set_notify_handling(&mut self, change: ChangeId, notify: NotifyHandling) -> &mut Self {
        self.scope.per_change_notify.insert(change, notify);
        self
    }

    /// Reflog message for every executed batch.
    pub fn set_ref_log_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.ref_log_message = Some(message.into());
        self
    }

    /// Signed push certificate attached to the executed batches.
    pub fn set_push_certificate(&mut self, cert: impl Into<String>) -> &mut Self {
        self.push_certificate = Some(cert.into());
        self
    }

    /// Validators run on the staged repository commands.
    pub fn set_on_submit_validators(&mut self, validators: OnSubmitValidators) -> &mut Self {
        self.validators = validators;
        self
    }

    // -- registration --

    fn check_not_executed(&self) -> Result<(), UpdateError> {
        if self.executed {
            return Err(UpdateError::usage("update already executed"));
        }
        Ok(())
    }

    fn register(&mut self, change: Option<ChangeId>, user: CurrentUser, op: OpSlot) {
        let reg = Registered::new(self.next_seq, user, op);
        self.next_seq += 1;
        match change {
            None => self.repo_ops.push(reg),
            Some(id) => {
                if !self.change_ops.contains_key(&id) {
                    self.change_order.push(id);
                }
                let ops = self.change_ops.entry(id).or_default();
                if matches!(reg.op, OpSlot::Insert(_)) {
                    ops.insert(0, reg);
                } else {
                    ops.push(reg);
                }
            }
        }
    }

    /// Register `op` for `change`, run as the update's user.
    ///
    /// # Errors
    /// `Usage` once the update was executed.
    pub fn add_op(
        &mut self,
        change: ChangeId,
        op: impl BatchUpdateOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        let user = self.user.clone();
        self.add_op_as(change, user, op)
    }

    /// Register `op` for `change`, run as `user`.
    ///
    /// # Errors
    /// `Usage` once the update was executed.
    pub fn add_op_as(
        &mut self,
        change: ChangeId,
        user: CurrentUser,
        op: impl BatchUpdateOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        self.check_not_executed()?;
        self.register(Some(change), user, OpSlot::Change(Box::new(op)));
        Ok(self)
    }

    /// Register a repository-only op, run as the update's user.
    ///
    /// # Errors
    /// `Usage` once the update was executed.
    pub fn add_repo_only_op(
        &mut self,
        op: impl RepoOnlyOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        let user = self.user.clone();
        self.add_repo_only_op_as(user, op)
    }

    /// Register a repository-only op, run as `user`.
    ///
    /// # Errors
    /// `Usage` once the update was executed.
    pub fn add_repo_only_op_as(
        &mut self,
        user: CurrentUser,
        op: impl RepoOnlyOp + 'static,
    ) -> Result<&mut Self, UpdateError> {
        self.check_not_executed()?;
        self.register(None, user, OpSlot::Repo(Box::new(op)));
        Ok(self)
    }

    /// Register background work run after the post-update phase.
    ///
    /// # Errors
    /// `Usage` once the update was executed.
    pub fn add_async_op(&mut self, op: Arc<dyn AsyncPostUpdateOp>) -> Result<&mut Self, UpdateError> {
        self.check_not_executed()?;
        self.async_ops.push(op);
        Ok(self)
    }

    /// Register `op`, which creates a new change, as the update's user.
    /// The op runs first among the ops of its change.
    ///
    /// # Errors
    /// `Usage` if another op already creates the same change or the update
    /// was executed; the mapped error if `create_change` fails.
    pub fn insert_change(
        &mut self,
        op: impl InsertChangeOp + 'static,
    ) -> Result<ChangeId, UpdateError> {
        let user = self.user.clone();
        self.insert_change_as(user, op)
    }

    /// Like [`insert_change`](Self::insert_change), run as `user`.
    ///
    /// # Errors
    /// As [`insert_change`](Self::insert_change).
    pub fn insert_change_as(
        &mut self,
        user: CurrentUser,
        mut op: impl InsertChangeOp + 'static,
    ) -> Result<ChangeId, UpdateError> {
        self.check_not_executed()?;
        let change = {
            let ctx = BaseContext::new(&self.scope, &user);
            op.create_change(&ctx)?
        };
        let id = change.id;
        if self.new_changes.contains_key(&id) {
            return Err(UpdateError::usage(format!(
                "only one op allowed to create change {id}"
            )));
        }
        if change.project != self.scope.project {
            return Err(UpdateError::usage(format!(
                "change {id} belongs to {}, not {}",
                change.project, self.scope.project
            )));
        }
        self.new_changes.insert(id, change);
        self.register(Some(id), user, OpSlot::Insert(Box::new(op)));
        Ok(id)
    }

    // -- results --

    /// `true` once executed, successfully or not.
    #[must_use]
    pub const fn is_executed(&self) -> bool {
        self.executed
    }

    /// What phase 2 did to `change`.
    #[must_use]
    pub fn change_result(&self, change: ChangeId) -> Option<ChangeResult> {
        self.results.get(&change).copied()
    }

    /// Every executed (or, in a dry run, prepared) ref command with its result.
    #[must_use]
    pub fn ref_updates(&self) -> Vec<&ReceiveCommand> {
        self.repo_batch
            .iter()
            .chain(self.change_batch.iter())
            .flat_map(BatchRefUpdate::commands)
            .collect()
    }

    /// Refs this update moved: every queued ref in a dry run, otherwise
    /// those whose command succeeded.
    #[must_use]
    pub fn successfully_updated_branches(&self, dryrun: bool) -> Vec<String> {
        self.repo_batch
            .iter()
            .chain(self.change_batch.iter())
            .flat_map(|b| b.successfully_updated(dryrun))
            .map(|c| c.ref_name().to_owned())
            .collect()
    }

    /// Reflog identity for this update's writes: the acting account if every
    /// change op runs as the same account, a shared identity for several
    /// accounts, the server identity when no op runs as an account, and
    /// `None` without change ops.
    ///
    /// # Errors
    /// `Usage` if identified and internal users are mixed.
    pub fn ref_log_ident(&self) -> Result<Option<PersonIdent>, UpdateError> {
        let users: Vec<&CurrentUser> = self
            .change_ops
            .values()
            .flatten()
            .map(|r| &r.user)
            .collect();
        if users.is_empty() {
            return Ok(None);
        }
        let accounts: Vec<&Account> = users.iter().filter_map(|u| u.account()).collect();
        if accounts.is_empty() {
            return Ok(Some(self.env.server_ident.clone()));
        }
        if accounts.len() != users.len() {
            return Err(UpdateError::usage(
                "batching updates of identified users and non-identified users is not supported",
            ));
        }
        let mut distinct: Vec<&Account> = Vec::new();
        for account in accounts {
            if !distinct.iter().any(|a| a.id == account.id) {
                distinct.push(account);
            }
        }
        distinct.sort_by_key(|a| a.id);
        if let [only] = distinct.as_slice() {
            return Ok(Some(only.ident()));
        }
        let ids: Vec<String> = distinct.iter().map(|a| format!("account-{}", a.id)).collect();
        Ok(Some(PersonIdent::new(
            ids.join("|"),
            self.env.server_ident.email.clone(),
        )))
    }

    // -- execution --

    /// Execute this update alone.
    ///
    /// # Errors
    /// See [`execute_all`](Self::execute_all).
    pub fn execute(&mut self) -> Result<(), UpdateError> {
        Self::execute_all(std::slice::from_mut(self), &[], false)
    }

    /// Execute `updates` together: every phase runs for every update before
    /// the next phase starts. Each update must target a different project.
    ///
    /// In a dry run everything is staged but no ref is written, nothing is
    /// reindexed, and post-update ops do not run.
    ///
    /// # Errors
    /// - `Usage` for duplicate projects, mixed orders, parallel change
    ///   updates with more than one update, or an update executed before.
    /// - The first failure of any phase; the remaining phases are skipped.
    #[instrument(skip_all, fields(updates = updates.len(), dryrun = dryrun))]
    pub fn execute_all(
        updates: &mut [Self],
        listeners: &[&dyn BatchUpdateListener],
        dryrun: bool,
    ) -> Result<(), UpdateError> {
        if updates.is_empty() {
            return Ok(());
        }
        for u in updates.iter() {
            u.check_not_executed()?;
        }
        check_different_projects(updates)?;
        let order = check_same_order(updates)?;
        if updates.len() > 1 && updates.iter().any(|u| u.parallel) {
            return Err(UpdateError::usage(
                "cannot execute ChangeOps in parallel with more than 1 BatchUpdate",
            ));
        }
        for u in updates.iter_mut() {
            u.executed = true;
        }

        let result = Self::run_phases(updates, listeners, dryrun, order);
        for u in updates.iter_mut() {
            if let Some(view) = u.view.take() {
                view.close();
            }
        }
        if let Err(e) = &result {
            tracing::debug!(error = %e, "batch update failed");
        }
        result
    }

    fn run_phases(
        updates: &mut [Self],
        listeners: &[&dyn BatchUpdateListener],
        dryrun: bool,
        order: Order,
    ) -> Result<(), UpdateError> {
        let combined = updates[0].env.config.update.atomic_ref_updates;
        match order {
            Order::RepoBeforeDb => {
                for u in updates.iter_mut() {
                    u.execute_update_repo()?;
                }
                notify(listeners, |l| l.after_update_repos())?;
                if !combined {
                    for u in updates.iter_mut() {
                        u.execute_repo_refs(dryrun)?;
                    }
                    notify(listeners, |l| l.after_update_refs())?;
                }
                for u in updates.iter_mut() {
                    u.execute_change_ops(dryrun)?;
                }
                if combined {
                    notify(listeners, |l| l.after_update_refs())?;
                }
                notify(listeners, |l| l.after_update_changes())?;
            }
            Order::DbBeforeRepo => {
                for u in updates.iter_mut() {
                    u.execute_change_ops(dryrun)?;
                }
                notify(listeners, |l| l.after_update_changes())?;
                for u in updates.iter_mut() {
                    u.execute_update_repo()?;
                }
                notify(listeners, |l| l.after_update_repos())?;
                for u in updates.iter_mut() {
                    u.execute_repo_refs(dryrun)?;
                }
                notify(listeners, |l| l.after_update_refs())?;
            }
        }

        for u in updates.iter_mut() {
            u.await_index_futures()?;
        }
        if dryrun {
            return Ok(());
        }

        for u in updates.iter() {
            u.fire_ref_events();
        }
        let mut all_data = BTreeMap::new();
        for u in updates.iter() {
            all_data.extend(u.change_data.iter().map(|(k, v)| (*k, v.clone())));
        }
        let all_data = Arc::new(all_data);
        for u in updates.iter_mut() {
            u.execute_post_ops(&all_data)?;
        }
        Ok(())
    }

    fn view_mut(&mut self) -> Result<&mut RepoView, UpdateError> {
        let view = match self.view.take() {
            Some(v) => v,
            None => RepoView::open(self.env.store.as_ref(), &self.scope.project)?,
        };
        Ok(self.view.insert(view))
    }

    fn write_options(&self) -> Result<WriteOptions, UpdateError> {
        Ok(WriteOptions {
            atomic: true,
            ref_log_message: self.ref_log_message.clone(),
            ref_log_ident: self.ref_log_ident()?,
            push_certificate: self.push_certificate.clone(),
        })
    }

    #[instrument(skip_all, fields(project = %self.scope.project))]
    fn execute_update_repo(&mut self) -> Result<(), UpdateError> {
        self.view_mut()?;
        let Self {
            scope,
            view,
            change_ops,
            repo_ops,
            validators,
            ..
        } = self;
        let Some(view) = view.as_mut() else {
            return Err(UpdateError::usage("repository view not open"));
        };
        for reg in ops_in_registration_order(change_ops, repo_ops) {
            let mut ctx = RepoContext::new(scope, &reg.user, view);
            reg.op.update_repo(&mut ctx).map_err(|e| {
                tracing::debug!(op = reg.op.name(), error = %e, "update_repo failed");
                UpdateError::from(e)
            })?;
        }
        if !validators.is_empty() && view.pending_ref_count() > 0 {
            validators.validate(view)?;
        }
        view.flush()?;
        tracing::debug!(commands = view.pending_ref_count(), "repository ops applied");
        Ok(())
    }

    #[instrument(skip_all, fields(project = %self.scope.project))]
    fn execute_repo_refs(&mut self, dryrun: bool) -> Result<(), UpdateError> {
        let opts = self.write_options()?;
        let env = Arc::clone(&self.env);
        let view = self.view_mut()?;
        if view.pending_ref_count() == 0 {
            view.clear_commands();
            return Ok(());
        }
        let mut batch = opts.new_batch(DEFAULT_REF_LOG_MESSAGE);
        view.drain_into(&mut batch);
        let outcome = if dryrun {
            Ok(())
        } else {
            env.backend.write(view, &mut batch)
        };
        tracing::debug!(commands = batch.commands().len(), ok = outcome.is_ok(), "repository refs executed");
        self.repo_batch = Some(batch);
        outcome
    }

    #[instrument(skip_all, fields(project = %self.scope.project, changes = self.change_order.len()))]
    fn execute_change_ops(&mut self, dryrun: bool) -> Result<(), UpdateError> {
        let opts = self.write_options()?;
        let env = Arc::clone(&self.env);
        self.view_mut()?;

        let started = Instant::now();
        let outcomes = self.run_update_change();
        env.metrics
            .record_latency("update_change", started.elapsed(), outcomes.is_ok());
        let outcomes = outcomes?;

        let Some(view) = self.view.as_mut() else {
            return Err(UpdateError::usage("repository view not open"));
        };
        let mut manager = UpdateManager::new(
            env.backend.as_ref(),
            env.store.as_ref(),
            env.shared_project.clone(),
            env.config.update.ignore_shared_write_failures,
        );
        for outcome in &outcomes {
            if let Some(pending) = &outcome.pending {
                manager.add(view, pending.clone())?;
            }
        }
        let writes = manager.execute(view, &opts, dryrun)?;
        let requires_reindex = writes.batch.as_ref().is_some_and(|b| !b.is_empty());
        self.change_batch = writes.batch;

        let await_indexing = env.config.update.await_indexing;
        for outcome in outcomes {
            let id = outcome.id;
            tracing::debug!(change = %id, result = ?outcome.result, "change processed");
            self.results.insert(id, outcome.result);
            let data = match outcome.result {
                ChangeResult::Skipped => continue,
                ChangeResult::Deleted => ChangeData {
                    change: outcome.before,
                    meta_id: None,
                },
                ChangeResult::Upserted if !await_indexing => ChangeData {
                    change: outcome.before,
                    meta_id: outcome.before_meta,
                },
                ChangeResult::Upserted => ChangeData {
                    change: outcome.after,
                    meta_id: writes.meta_ids.get(&id).copied().flatten(),
                },
            };
            self.change_data.insert(id, data);
            if dryrun || !requires_reindex {
                continue;
            }
            let future = if outcome.result == ChangeResult::Deleted {
                env.indexer.delete_async(&self.scope.project, id)
            } else {
                env.indexer.index_async(&self.scope.project, id)
            };
            if await_indexing {
                self.index_futures.push((id, future));
            } else {
                let project = self.scope.project.clone();
                let submitted = env.async_pool.submit(move || {
                    if let Err(e) = future.wait() {
                        tracing::warn!(%project, change = %id, error = %e, "background reindex failed");
                    }
                });
                if let Err(e) = submitted {
                    tracing::warn!(change = %id, error = %e, "could not hand off reindex");
                }
            }
        }
        Ok(())
    }

    fn run_update_change(&mut self) -> Result<Vec<ChangeOutcome>, UpdateError> {
        let Self {
            env,
            scope,
            view,
            change_ops,
            change_order,
            new_changes,
            parallel,
            ..
        } = self;
        let Some(view) = view.as_ref() else {
            return Err(UpdateError::usage("repository view not open"));
        };
        let scope: &UpdateScope = scope;
        let new_changes: &HashMap<ChangeId, Change> = new_changes;
        let mut by_id: HashMap<ChangeId, &mut Vec<Registered>> =
            change_ops.iter_mut().map(|(k, v)| (*k, v)).collect();
        let mut work: Vec<(ChangeId, &mut Vec<Registered>)> = Vec::new();
        for id in change_order.iter() {
            if let Some(ops) = by_id.remove(id) {
                work.push((*id, ops));
            }
        }
        let backend = env.backend.as_ref();

        if !*parallel || work.len() < 2 {
            return work
                .into_iter()
                .map(|(id, ops)| {
                    update_one_change(scope, view, backend, id, ops, new_changes.get(&id))
                })
                .collect();
        }

        let threads = env.config.update.change_update_threads.max(1).min(work.len());
        let store = env.store.as_ref();
        let total = work.len();
        let outcome = crossbeam::scope(|s| {
            let (work_tx, work_rx) = bounded::<(usize, ChangeId, &mut Vec<Registered>)>(total);
            let (res_tx, res_rx) = unbounded();
            for _ in 0..threads {
                let work_rx = work_rx.clone();
                let res_tx = res_tx.clone();
                s.spawn(move |_| {
                    let handle = store.open_repository(&scope.project);
                    for (idx, id, ops) in work_rx {
                        let result = match &handle {
                            Ok(repo) => {
                                let worker_view = view.snapshot_with(Arc::clone(repo));
                                update_one_change(
                                    scope,
                                    &worker_view,
                                    backend,
                                    id,
                                    ops,
                                    new_changes.get(&id),
                                )
                            }
                            Err(e) => Err(UpdateError::Other(anyhow::anyhow!(
                                "opening {} for change {id}: {e}",
                                scope.project
                            ))),
                        };
                        if res_tx.send((idx, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);
            for (idx, (id, ops)) in work.into_iter().enumerate() {
                if work_tx.send((idx, id, ops)).is_err() {
                    break;
                }
            }
            drop(work_tx);
            let mut results: Vec<(usize, Result<ChangeOutcome, UpdateError>)> =
                res_rx.iter().collect();
            results.sort_by_key(|(idx, _)| *idx);
            results
        })
        .map_err(|_| UpdateError::Other(anyhow::anyhow!("change update worker panicked")))?;

        if outcome.len() != total {
            return Err(UpdateError::Other(anyhow::anyhow!(
                "{} of {total} change updates did not finish",
                total - outcome.len()
            )));
        }
        outcome.into_iter().map(|(_, r)| r).collect()
    }

    fn await_index_futures(&mut self) -> Result<(), UpdateError> {
        for (id, future) in self.index_futures.drain(..) {
            future.wait().map_err(|e| {
                tracing::warn!(change = %id, error = %e, "reindex failed");
                e
            })?;
        }
        Ok(())
    }

    fn fire_ref_events(&self) {
        for batch in self.repo_batch.iter().chain(self.change_batch.iter()) {
            if batch.is_executed() && !batch.is_empty() {
                self.env
                    .notifier
                    .fire(&self.scope.project, batch, self.user.account());
            }
        }
    }

    #[instrument(skip_all, fields(project = %self.scope.project))]
    fn execute_post_ops(
        &mut self,
        change_data: &Arc<BTreeMap<ChangeId, ChangeData>>,
    ) -> Result<(), UpdateError> {
        let env = Arc::clone(&self.env);
        self.view_mut()?;
        let Self {
            scope,
            user,
            view,
            change_ops,
            repo_ops,
            async_ops,
            ..
        } = self;
        let Some(view) = view.as_ref() else {
            return Err(UpdateError::usage("repository view not open"));
        };
        let mut scheduled: Vec<Arc<dyn AsyncPostUpdateOp>> = async_ops.clone();
        for reg in ops_in_registration_order(change_ops, repo_ops) {
            let mut ctx = PostUpdateContext::new(scope, &reg.user, view, change_data, &mut scheduled);
            reg.op.post_update(&mut ctx).map_err(|e| {
                tracing::debug!(op = reg.op.name(), error = %e, "post_update failed");
                UpdateError::from(e)
            })?;
        }

        for op in scheduled {
            let ctx = AsyncContext::new(scope.clone(), user.clone(), Arc::clone(change_data));
            let submitted = env.async_pool.submit(move || {
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
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn notify(
    listeners: &[&dyn BatchUpdateListener],
    hook: impl Fn(&dyn BatchUpdateListener) -> Result<(), UpdateError>,
) -> Result<(), UpdateError> {
    for listener in listeners {
        hook(*listener)?;
    }
    Ok(())
}

fn check_different_projects(updates: &[BatchUpdate]) -> Result<(), UpdateError> {
    let mut seen = HashSet::new();
    for u in updates {
        if !seen.insert(&u.scope.project) {
            return Err(UpdateError::usage(format!(
                "updates must all be for different projects, got {} twice",
                u.scope.project
            )));
        }
    }
    Ok(())
}

fn check_same_order(updates: &[BatchUpdate]) -> Result<Order, UpdateError> {
    let order = updates[0].order;
    if updates.iter().any(|u| u.order != order) {
        return Err(UpdateError::usage("cannot mix execution orders"));
    }
    Ok(order)
}

pub(crate) fn ops_in_registration_order<'a>(
    change_ops: &'a mut HashMap<ChangeId, Vec<Registered>>,
    repo_ops: &'a mut [Registered],
) -> Vec<&'a mut Registered> {
    let mut all: Vec<&mut Registered> = change_ops
        .values_mut()
        .flat_map(|ops| ops.iter_mut())
        .chain(repo_ops.iter_mut())
        .collect();
    all.sort_by_key(|r| r.seq);
    all
}

pub(crate) struct ChangeOutcome {
    pub(crate) id: ChangeId,
    pub(crate) result: ChangeResult,
    pub(crate) pending: Option<PendingChange>,
    pub(crate) before: Change,
    pub(crate) before_meta: Option<refbatch_git::GitOid>,
    pub(crate) after: Change,
}

/// Phase 2 for one change: run every op, then decide skipped, upserted, or
/// deleted. Nothing is written here.
pub(crate) fn update_one_change(
    scope: &UpdateScope,
    view: &RepoView,
    backend: &dyn DurabilityBackend,
    id: ChangeId,
    ops: &mut [Registered],
    new_change: Option<&Change>,
) -> Result<ChangeOutcome, UpdateError> {
    let first_author = ops.first().and_then(|r| r.user.account().cloned());
    let mut state = match new_change {
        Some(change) => ChangeState::inserted(change.clone(), first_author, scope.when),
        None => {
            let notes = backend
                .read_back(view, id)?
                .ok_or(OpError::NoSuchChange(id))?;
            ChangeState::existing(notes, first_author, scope.when)
        }
    };
    let before = state.change.clone();
    let before_meta = state.notes.as_ref().map(|n| n.meta_id);

    for reg in ops.iter_mut() {
        state.switch_author(reg.user.account().cloned());
        let mut ctx = ChangeContext::new(scope, &reg.user, view, &mut state);
        let dirty = reg.op.update_change(&mut ctx).map_err(|e| {
            tracing::debug!(change = %id, op = reg.op.name(), error = %e, "update_change failed");
            UpdateError::from(e)
        })?;
        state.dirty |= dirty;
    }

    if !state.dirty {
        return Ok(ChangeOutcome {
            id,
            result: ChangeResult::Skipped,
            pending: None,
            after: before.clone(),
            before,
            before_meta,
        });
    }

    let deleted = state.deleted;
    let (mut after, _notes, mut updates) = state.into_updates();
    updates.sort_by_key(crate::notes::ChangeUpdate::patch_set);
    for update in &updates {
        update.apply_to(&mut after);
    }
    Ok(ChangeOutcome {
        id,
        result: if deleted {
            ChangeResult::Deleted
        } else {
            ChangeResult::Upserted
        },
        pending: Some(PendingChange {
            id,
            updates,
            deleted,
        }),
        before,
        before_meta,
        after,
    })
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use refbatch_git::InMemoryRepositoryStore;

    use super::*;

    struct Named(&'static str);

    impl RepoOnlyOp for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    impl BatchUpdateOp for Named {}

    fn factory() -> BatchUpdateFactory {
        let store = Arc::new(InMemoryRepositoryStore::new());
        store.create_repository(&project()).unwrap();
        BatchUpdateFactory::builder(store).build().unwrap()
    }

    fn project() -> ProjectName {
        ProjectName::new("p").unwrap()
    }

    fn user(id: u32) -> CurrentUser {
        CurrentUser::Identified(Account::new(id, format!("User {id}"), format!("u{id}@example.com")))
    }

    #[test]
    fn ops_run_in_global_registration_order() {
        let f = factory();
        let mut u = f.create(project(), user(1), UNIX_EPOCH);
        u.add_op(ChangeId::new(2), Named("c2-a")).unwrap();
        u.add_repo_only_op(Named("repo-a")).unwrap();
        u.add_op(ChangeId::new(1), Named("c1-a")).unwrap();
        u.add_op(ChangeId::new(2), Named("c2-b")).unwrap();
        u.add_repo_only_op(Named("repo-b")).unwrap();

        let names: Vec<&str> = ops_in_registration_order(&mut u.change_ops, &mut u.repo_ops)
            .into_iter()
            .map(|r| r.op.name())
            .collect();
        assert_eq!(names, ["c2-a", "repo-a", "c1-a", "c2-b", "repo-b"]);
        assert_eq!(u.change_order, [ChangeId::new(2), ChangeId::new(1)]);
    }

    #[test]
    fn ref_log_ident_by_users() {
        let f = factory();

        let mut u = f.create(project(), user(1), UNIX_EPOCH);
        u.add_repo_only_op(Named("repo")).unwrap();
        assert_eq!(u.ref_log_ident().unwrap(), None);

        u.add_op(ChangeId::new(1), Named("a")).unwrap();
        assert_eq!(
            u.ref_log_ident().unwrap(),
            Some(PersonIdent::new("User 1", "u1@example.com"))
        );

        u.add_op_as(ChangeId::new(2), user(7), Named("b")).unwrap();
        u.add_op_as(ChangeId::new(3), user(1), Named("c")).unwrap();
        let ident = u.ref_log_ident().unwrap().unwrap();
        assert_eq!(ident.name, "account-1|account-7");
        assert_eq!(ident.email, f.server_ident().email);

        let mut internal = f.create(project(), CurrentUser::Internal, UNIX_EPOCH);
        internal.add_op(ChangeId::new(1), Named("a")).unwrap();
        assert_eq!(internal.ref_log_ident().unwrap().as_ref(), Some(f.server_ident()));

        internal.add_op_as(ChangeId::new(1), user(1), Named("b")).unwrap();
        assert!(matches!(internal.ref_log_ident(), Err(UpdateError::Usage(_))));
    }

    #[test]
    fn insert_must_match_project() {
        let f = factory();
        let mut u = f.create(project(), user(1), UNIX_EPOCH);

        struct Insert(Change);
        impl RepoOnlyOp for Insert {}
        impl BatchUpdateOp for Insert {}
        impl InsertChangeOp for Insert {
            fn create_change(&mut self, _ctx: &dyn crate::context::Context) -> Result<Change, OpError> {
                Ok(self.0.clone())
            }
        }

        let elsewhere = Change::new(
            ChangeId::new(9),
            ProjectName::new("q").unwrap(),
            "refs/heads/main",
            crate::change::AccountId::new(1),
            UNIX_EPOCH,
        );
        assert!(matches!(u.insert_change(Insert(elsewhere)), Err(UpdateError::Usage(_))));
    }
}
