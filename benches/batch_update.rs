//! Batch update benchmarks.
//!
//! Measures one `BatchUpdate` touching many changes on the in-memory store,
//! serially and with parallel change updates.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench batch_update
//! # With a custom filter:
//! cargo bench --bench batch_update -- parallel
//! ```

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use refbatch::{
    Account, BatchUpdateFactory, BatchUpdateOp, Change, ChangeContext, ChangeId, Context,
    CurrentUser, InsertChangeOp, OpError, RepoOnlyOp,
};
use refbatch_git::{InMemoryRepositoryStore, ProjectName};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Create(Change);

impl RepoOnlyOp for Create {}

impl BatchUpdateOp for Create {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.update(1)
            .set_subject("bench")
            .set_change_message("Uploaded patch set 1.");
        Ok(true)
    }
}

impl InsertChangeOp for Create {
    fn create_change(&mut self, _ctx: &dyn Context) -> Result<Change, OpError> {
        Ok(self.0.clone())
    }
}

struct Comment;

impl RepoOnlyOp for Comment {}

impl BatchUpdateOp for Comment {
    fn update_change(&mut self, ctx: &mut ChangeContext<'_>) -> Result<bool, OpError> {
        ctx.update(1).set_change_message("LGTM");
        Ok(true)
    }
}

fn user() -> CurrentUser {
    CurrentUser::Identified(Account::new(1000, "Bench", "bench@example.com"))
}

/// A factory over a fresh store holding `n` changes.
fn setup(n: u32) -> (BatchUpdateFactory, ProjectName) {
    let store = Arc::new(InMemoryRepositoryStore::new());
    let project = ProjectName::new("bench").expect("project name");
    store.create_repository(&project).expect("create project");
    store
        .create_repository(&ProjectName::new("All-Users").expect("project name"))
        .expect("create shared project");
    let factory = BatchUpdateFactory::builder(store)
        .build()
        .expect("factory");

    let when = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let mut update = factory.create(project.clone(), user(), when);
    for i in 1..=n {
        let change = Change::new(
            ChangeId::new(i),
            project.clone(),
            "refs/heads/main",
            refbatch::AccountId::new(1000),
            when,
        );
        update.insert_change(Create(change)).expect("insert");
    }
    update.execute().expect("create changes");
    (factory, project)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_update(c: &mut Criterion, name: &str, parallel: bool) {
    let mut group = c.benchmark_group(name);
    group.sample_size(20);
    for n in [10u32, 100, 500] {
        let (factory, project) = setup(n);
        group.throughput(Throughput::Elements(u64::from(n)));
        group.bench_with_input(BenchmarkId::new("changes", n), &n, |b, &n| {
            b.iter(|| {
                let mut update = factory.create(project.clone(), user(), UNIX_EPOCH);
                if parallel {
                    update.update_changes_in_parallel();
                }
                for i in 1..=n {
                    update.add_op(ChangeId::new(i), Comment).expect("add op");
                }
                update.execute().expect("execute");
            });
        });
    }
    group.finish();
}

fn bench_serial(c: &mut Criterion) {
    bench_update(c, "update_changes/serial", false);
}

fn bench_parallel(c: &mut Criterion) {
    bench_update(c, "update_changes/parallel", true);
}

criterion_group!(benches, bench_serial, bench_parallel);
criterion_main!(benches);
