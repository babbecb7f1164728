//! Shared helpers for refbatch integration tests.
//!
//! Everything runs against the in-memory store; recording collaborators
//! capture reindex requests and ref-update events.

#![allow(dead_code, clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use refbatch::index::{IndexFuture, Indexer};
use refbatch::metrics::InMemoryMetrics;
use refbatch::notes::ChangeNotes;
use refbatch::notify::ReferenceUpdateNotifier;
use refbatch::{
    Account, BatchRefUpdate, BatchUpdate, BatchUpdateFactory, BatchUpdateOp, Change,
    ChangeContext, ChangeId, Context, CurrentUser, InsertChangeOp, OpError, PostUpdateContext,
    ReceiveCommand, RefbatchConfig, RepoContext, RepoOnlyOp,
};
use refbatch_git::{GitOid, GitRepo, InMemoryRepositoryStore, MemRepo, ProjectName};

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexEvent {
    Upsert(ChangeId),
    Delete(ChangeId),
}

/// Records every reindex request; futures resolve immediately unless
/// `fail` is set.
#[derive(Default)]
pub struct RecordingIndexer {
    pub events: Mutex<Vec<IndexEvent>>,
    pub fail: Mutex<bool>,
}

impl RecordingIndexer {
    pub fn events(&self) -> Vec<IndexEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn future(&self) -> IndexFuture {
        if *self.fail.lock().unwrap() {
            IndexFuture::failed("index unavailable")
        } else {
            IndexFuture::ready()
        }
    }
}

impl Indexer for RecordingIndexer {
    fn index_async(&self, _project: &ProjectName, id: ChangeId) -> IndexFuture {
        self.events.lock().unwrap().push(IndexEvent::Upsert(id));
        self.future()
    }

    fn delete_async(&self, _project: &ProjectName, id: ChangeId) -> IndexFuture {
        self.events.lock().unwrap().push(IndexEvent::Delete(id));
        self.future()
    }
}

/// One fired ref-update event.
#[derive(Clone, Debug)]
pub struct FiredEvent {
    pub project: ProjectName,
    pub refs: Vec<String>,
    pub actor: Option<Account>,
    pub push_certificate: Option<String>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<FiredEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<FiredEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ReferenceUpdateNotifier for RecordingNotifier {
    fn fire(&self, project: &ProjectName, batch: &BatchRefUpdate, actor: Option<&Account>) {
        self.events.lock().unwrap().push(FiredEvent {
            project: project.clone(),
            refs: batch
                .commands()
                .iter()
                .map(|c| c.ref_name().to_owned())
                .collect(),
            actor: actor.cloned(),
            push_certificate: batch.push_certificate().map(str::to_owned),
        });
    }
}

// ---------------------------------------------------------------------------
// Test environment
// ---------------------------------------------------------------------------

pub const ALL_USERS: &str = "All-Users";

pub fn project(name: &str) -> ProjectName {
    ProjectName::new(name).unwrap()
}

pub fn admin() -> Account {
    Account::new(1000, "Administrator", "admin@example.com")
}

pub fn other_user() -> Account {
    Account::new(1001, "Other User", "other@example.com")
}

pub fn now() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// A store with project `test` and the shared `All-Users` project.
pub struct TestEnv {
    pub store: Arc<InMemoryRepositoryStore>,
    pub project: ProjectName,
    pub repo: Arc<MemRepo>,
    pub shared: Arc<MemRepo>,
    pub indexer: Arc<RecordingIndexer>,
    pub notifier: Arc<RecordingNotifier>,
    pub metrics: Arc<InMemoryMetrics>,
    pub factory: BatchUpdateFactory,
    next_change: Mutex<u32>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(RefbatchConfig::default())
    }

    pub fn with_config(config: RefbatchConfig) -> Self {
        refbatch::telemetry::init_for_tests();
        let store = Arc::new(InMemoryRepositoryStore::new());
        let project = project("test");
        let repo = store.create_repository(&project).unwrap();
        let shared = store.create_repository(&self::project(ALL_USERS)).unwrap();
        let indexer = Arc::new(RecordingIndexer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let factory = BatchUpdateFactory::builder(store.clone())
            .indexer(indexer.clone())
            .notifier(notifier.clone())
            .metrics(metrics.clone())
            .config(config)
            .build()
            .unwrap();
        Self {
            store,
            project,
            repo,
            shared,
            indexer,
            notifier,
            metrics,
            factory,
            next_change: Mutex::new(1),
        }
    }

    /// Add another project to the store.
    pub fn add_project(&self, name: &str) -> Arc<MemRepo> {
        self.store.create_repository(&project(name)).unwrap()
    }

    pub fn user(&self) -> CurrentUser {
        CurrentUser::Identified(admin())
    }

    pub fn update(&self) -> BatchUpdate {
        self.factory
            .create(self.project.clone(), self.user(), now())
    }

    pub fn update_for(&self, project: &ProjectName) -> BatchUpdate {
        self.factory.create(project.clone(), self.user(), now())
    }

    /// Create a change in `project` with one metadata commit. Recorded
    /// reindex and notification events are cleared afterwards.
    pub fn create_change_in(&self, project: &ProjectName) -> ChangeId {
        let id = {
            let mut next = self.next_change.lock().unwrap();
            let id = ChangeId::new(*next);
            *next += 1;
            id
        };
        let mut update = self.update_for(project);
        update
            .insert_change(CreateChangeOp::new(Change::new(
                id,
                project.clone(),
                "refs/heads/master",
                admin().id,
                now(),
            )))
            .unwrap();
        update.execute().unwrap();
        self.indexer.clear();
        self.notifier.events.lock().unwrap().clear();
        id
    }

    pub fn create_change(&self) -> ChangeId {
        self.create_change_in(&self.project.clone())
    }

    pub fn meta_id(&self, id: ChangeId) -> Option<GitOid> {
        meta_id(self.repo.as_ref(), id)
    }

    /// Metadata commits of `id`, root first.
    pub fn meta_history(&self, id: ChangeId) -> Vec<String> {
        self.notes(id).messages
    }

    pub fn notes(&self, id: ChangeId) -> ChangeNotes {
        ChangeNotes::load(self.repo.as_ref(), &self.project, id)
            .unwrap()
            .expect("change exists")
    }
}

pub fn meta_id(repo: &dyn GitRepo, id: ChangeId) -> Option<GitOid> {
    ref_value(repo, &id.meta_ref())
}

pub fn ref_value(repo: &dyn GitRepo, name: &str) -> Option<GitOid> {
    repo.read_ref(&refbatch_git::RefName::new(name).unwrap())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// Creates a change with an initial message on patch set 1.
pub struct CreateChangeOp {
    change: Change,
    pub created: Arc<Mutex<Option<ChangeId>>>,
}

impl CreateChangeOp {
    pub fn new(change: Change) -> Self {
        Self {
            change,
            created: Arc::default(),
        }
    }
}

impl RepoOnlyOp for CreateChangeOp {}

impl BatchUpdateOp for CreateChangeOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.update(1)
            .set_subject("Initial subject")
            .set_change_message("Uploaded patch set 1.");
        *self.created.lock().unwrap() = Some(ctx.change().id);
        Ok(true)
    }
}

impl InsertChangeOp for CreateChangeOp {
    fn create_change(&mut self, _ctx: &dyn Context) -> Result<Change, OpError> {
        Ok(self.change.clone())
    }
}

/// Posts a message on patch set `patch_set`.
#[derive(Clone)]
pub struct PostMessageOp {
    pub patch_set: u32,
    pub message: String,
    pub post_updates: Arc<Mutex<u32>>,
}

impl PostMessageOp {
    pub fn new(message: &str) -> Self {
        Self::on(1, message)
    }

    pub fn on(patch_set: u32, message: &str) -> Self {
        Self {
            patch_set,
            message: message.to_owned(),
            post_updates: Arc::default(),
        }
    }

    pub fn post_update_count(&self) -> u32 {
        *self.post_updates.lock().unwrap()
    }
}

impl RepoOnlyOp for PostMessageOp {
    fn post_update(&mut self, _ctx: &mut PostUpdateContext<'_>) -> Result<(), OpError> {
        *self.post_updates.lock().unwrap() += 1;
        Ok(())
    }
}

impl BatchUpdateOp for PostMessageOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.update(self.patch_set)
            .set_change_message(self.message.clone());
        Ok(true)
    }
}

/// Looks at the change and reports it clean.
#[derive(Default)]
pub struct NoopChangeOp {
    pub calls: Arc<Mutex<u32>>,
}

impl RepoOnlyOp for NoopChangeOp {}

impl BatchUpdateOp for NoopChangeOp {
    fn update_change(&mut self, _ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        *self.calls.lock().unwrap() += 1;
        Ok(false)
    }
}

/// Fails in `update_change` with the given error.
pub struct FailingChangeOp(pub fn() -> OpError);

impl RepoOnlyOp for FailingChangeOp {}

impl BatchUpdateOp for FailingChangeOp {
    fn update_change(&mut self, _ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        Err((self.0)())
    }
}

/// Deletes the change.
pub struct DeleteChangeOp;

impl RepoOnlyOp for DeleteChangeOp {}

impl BatchUpdateOp for DeleteChangeOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.delete_change();
        Ok(true)
    }
}

/// Creates (or moves) refs to `target` in phase 1.
pub struct CreateRefsOp {
    pub refs: Vec<String>,
    pub target: GitOid,
}

impl CreateRefsOp {
    pub fn new(refs: &[&str], target: GitOid) -> Self {
        Self {
            refs: refs.iter().map(|r| (*r).to_owned()).collect(),
            target,
        }
    }

    pub fn one(name: &str, target: GitOid) -> Self {
        Self::new(&[name], target)
    }
}

impl RepoOnlyOp for CreateRefsOp {
    fn update_repo(&mut self, ctx: &mut RepoContext<'_>) -> Result<(), OpError> {
        for name in &self.refs {
            ctx.add_ref_update(ReceiveCommand::create(name.clone(), self.target))?;
        }
        Ok(())
    }
}

impl BatchUpdateOp for CreateRefsOp {}

/// Writes a root commit with an empty tree.
pub fn write_commit(repo: &dyn GitRepo, msg: &str) -> GitOid {
    let tree = repo.write_tree(&[]).unwrap();
    repo.create_commit(tree, &[], msg, None).unwrap()
}
