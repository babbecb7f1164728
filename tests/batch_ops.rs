//! Chunked execution through `BatchOpsExecutor`.

#![allow(clippy::all, clippy::pedantic, clippy::nursery)]

mod common;

use refbatch::{
    BatchOpsExecutor, BatchUpdateOp, ChangeContext, ChangeId, ChangeResult, CommandResult,
    DraftComment, ErrorStatus, OpError, ReceiveCommand, RepoContext, RepoOnlyOp, UpdateError,
};
use refbatch_git::GitOid;

use common::{
    CreateRefsOp, FailingChangeOp, IndexEvent, PostMessageOp, TestEnv, admin, now, ref_value,
    write_commit,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn executor(env: &TestEnv) -> BatchOpsExecutor {
    BatchOpsExecutor::new(&env.factory, env.project.clone(), env.user(), now()).unwrap()
}

/// Records the upload message of a new patch set.
struct NewPatchSetOp {
    patch_set: u32,
    commit: GitOid,
}

impl RepoOnlyOp for NewPatchSetOp {}

impl BatchUpdateOp for NewPatchSetOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        let patch_set = self.patch_set;
        ctx.update(patch_set)
            .set_change_message(format!("Uploaded patch set {patch_set}."));
        Ok(true)
    }
}

/// Stages the patch-set ref in the repository phase, then the message.
struct UploadOp(NewPatchSetOp, ChangeId);

impl RepoOnlyOp for UploadOp {
    fn update_repo(&mut self, ctx: &mut RepoContext<'_>) -> Result<(), OpError> {
        ctx.add_ref_update(ReceiveCommand::create(
            self.1.patch_set_ref(self.0.patch_set),
            self.0.commit,
        ))
    }
}

impl BatchUpdateOp for UploadOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        self.0.update_change(ctx)
    }
}

/// Leaves a draft and a message.
struct DraftOp;

impl RepoOnlyOp for DraftOp {}

impl BatchUpdateOp for DraftOp {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.update(1)
            .set_change_message("commented")
            .put_draft(DraftComment {
                author: admin().id,
                patch_set: 1,
                file: "README".into(),
                line: 1,
                message: "typo".into(),
            });
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn executes_added_ops() {
    let env = TestEnv::new();
    let id = env.create_change();
    let op = PostMessageOp::new("batched");

    let mut ex = executor(&env);
    ex.add_op_batch(id, op.clone()).unwrap();
    assert_eq!(ex.refs_in_update(), 1);
    assert!(ex.get_ref_updates().is_empty());
    assert_eq!(ex.change_result(id), Some(ChangeResult::Upserted));
    ex.execute().unwrap();

    assert!(ex.is_executed());
    let updates = ex.get_ref_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[&id.meta_ref()].result(), CommandResult::Ok);
    assert_eq!(env.notes(id).messages.last().map(String::as_str), Some("batched"));
    assert_eq!(env.indexer.events(), vec![IndexEvent::Upsert(id)]);
    assert_eq!(env.notifier.events().len(), 1);
    assert_eq!(op.post_update_count(), 1);
}

#[test]
fn failed_add_leaves_nothing_behind() {
    let env = TestEnv::new();
    let id = env.create_change();
    let commit = write_commit(env.repo.as_ref(), "ps2");

    let mut ex = executor(&env);
    let err = ex
        .add_ops_batch(
            id,
            vec![
                Box::new(UploadOp(NewPatchSetOp { patch_set: 2, commit }, id)),
                Box::new(FailingChangeOp(|| OpError::InvalidChangeOperation("closed".into()))),
            ],
        )
        .unwrap_err();
    assert_eq!(err.status(), ErrorStatus::Conflict);
    assert_eq!(ex.refs_in_update(), 0);
    assert_eq!(ex.change_result(id), None);

    ex.add_op_batch(id, PostMessageOp::new("retry")).unwrap();
    assert_eq!(ex.refs_in_update(), 1);
    ex.execute().unwrap();
    assert_eq!(ref_value(env.repo.as_ref(), &id.patch_set_ref(2)), None);
}

#[test]
fn ops_for_a_change_are_added_once() {
    let env = TestEnv::new();
    let id = env.create_change();

    let mut ex = executor(&env);
    ex.add_op_batch(id, PostMessageOp::new("one")).unwrap();
    let err = ex.add_op_batch(id, PostMessageOp::new("two")).unwrap_err();
    assert!(matches!(err, UpdateError::Usage(_)));
    assert!(err.to_string().contains(&format!("ops for change {id} already added")));
}

#[test]
fn upload_stages_patch_set_and_meta_refs() {
    let env = TestEnv::new();
    let id = env.create_change();
    let commit = write_commit(env.repo.as_ref(), "ps2");

    let mut ex = executor(&env);
    ex.add_op_batch(id, UploadOp(NewPatchSetOp { patch_set: 2, commit }, id))
        .unwrap();
    assert_eq!(ex.refs_in_update(), 2);
    ex.execute().unwrap();

    let refs = ex.get_ref_updates();
    assert_eq!(
        refs.keys().cloned().collect::<Vec<_>>(),
        vec![id.patch_set_ref(2), id.meta_ref()]
    );
    assert!(refs.values().all(|c| c.result() == CommandResult::Ok));
    assert_eq!(env.notes(id).change.current_patch_set, 2);
}

#[test]
fn non_atomic_batch_refuses_two_refs_of_one_change() {
    let env = TestEnv::new();
    let id = env.create_change();
    let commit = write_commit(env.repo.as_ref(), "ps2");
    let meta = env.meta_id(id);

    let mut ex = executor(&env);
    ex.set_non_atomic();
    ex.add_op_batch(id, UploadOp(NewPatchSetOp { patch_set: 2, commit }, id))
        .unwrap();
    let err = ex.execute().unwrap_err();

    assert!(matches!(err, UpdateError::Usage(_)));
    assert_eq!(ex.refs_in_update(), 2);
    assert!(ex
        .get_ref_updates()
        .values()
        .all(|c| c.result() == CommandResult::NotAttempted));
    assert_eq!(env.meta_id(id), meta);
    assert!(env.indexer.events().is_empty());
}

#[test]
fn failed_execute_still_reports_the_batch() {
    let env = TestEnv::new();
    let a = env.create_change();
    let b = env.create_change();

    let mut ex = executor(&env);
    ex.add_op_batch(a, PostMessageOp::new("a")).unwrap();
    ex.add_op_batch(b, PostMessageOp::new("b")).unwrap();
    env.repo.inject_lock_failures(1);
    let err = ex.execute().unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(ex.refs_in_update(), 2);
    let updates = ex.get_ref_updates();
    assert_eq!(updates.len(), 2);
    assert!(updates.values().all(|c| c.result() != CommandResult::Ok));
    assert!(env.notifier.events().is_empty());

    let err = ex.execute().unwrap_err();
    assert!(err.to_string().contains("update already executed"));
}

#[test]
fn drafts_are_not_counted() {
    let env = TestEnv::new();
    let id = env.create_change();

    let mut ex = executor(&env);
    ex.add_op_batch(id, DraftOp).unwrap();
    assert_eq!(ex.refs_in_update(), 1);
    ex.execute().unwrap();

    assert_eq!(ex.get_ref_updates().len(), 1);
    let draft_ref = id.draft_comments_ref(admin().id);
    assert!(
        env.shared
            .refs()
            .unwrap()
            .keys()
            .any(|r| r.as_str() == draft_ref)
    );
}

#[test]
fn repo_only_ops_count_toward_the_chunk() {
    let env = TestEnv::new();
    let tip = write_commit(env.repo.as_ref(), "tip");

    let mut ex = executor(&env);
    ex.add_repo_only_op_batch(CreateRefsOp::new(&["refs/heads/a", "refs/heads/b"], tip))
        .unwrap();
    assert_eq!(ex.refs_in_update(), 2);
    ex.execute().unwrap();
    assert_eq!(ref_value(env.repo.as_ref(), "refs/heads/a"), Some(tip));
    assert!(env.indexer.events().is_empty());
}

#[test]
fn missing_change_is_not_found() {
    let env = TestEnv::new();
    let mut ex = executor(&env);
    let err = ex
        .add_op_batch(ChangeId::new(12345), PostMessageOp::new("x"))
        .unwrap_err();
    assert_eq!(err.status(), ErrorStatus::NotFound);
    assert_eq!(ex.refs_in_update(), 0);
}

#[test]
fn clear_starts_the_next_chunk() {
    let env = TestEnv::new();
    let ids: Vec<ChangeId> = (0..5).map(|_| env.create_change()).collect();
    let chunk = 2;

    let mut ex = executor(&env);
    assert!(ex.max_refs_per_batch() >= chunk);
    let mut executions = 0;
    for id in &ids {
        ex.add_op_batch(*id, PostMessageOp::new("chunked")).unwrap();
        if ex.refs_in_update() >= chunk {
            ex.execute().unwrap();
            ex.clear();
            executions += 1;
        }
    }
    if ex.refs_in_update() > 0 {
        ex.execute().unwrap();
        executions += 1;
    }
    ex.close();

    assert_eq!(executions, 3);
    for id in &ids {
        assert_eq!(env.notes(*id).messages.last().map(String::as_str), Some("chunked"));
    }
    assert_eq!(env.indexer.events().len(), ids.len());
}
