use std::path::Path;

use tempfile::TempDir;

use refbatch_git::{
    EntryMode, FsRepositoryStore, GitError, GitOid, GitRepo, GixRepo, PersonIdent, ProjectName,
    RefEdit, RefLog, RefName, RepositoryStore, TreeEntry,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
}

fn init_bare(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    git(path, &["init", "--bare", "."]);
    git(path, &["config", "user.email", "test@test.com"]);
    git(path, &["config", "user.name", "Test User"]);
}

fn setup_repo() -> (TempDir, GixRepo) {
    let dir = TempDir::new().unwrap();
    init_bare(dir.path());
    let repo = GixRepo::open(dir.path()).unwrap();
    (dir, repo)
}

fn name(s: &str) -> RefName {
    RefName::new(s).unwrap()
}

fn commit(repo: &GixRepo, parents: &[GitOid], msg: &str) -> GitOid {
    let blob = repo.write_blob(msg.as_bytes()).unwrap();
    let tree = repo
        .write_tree(&[TreeEntry {
            name: "msg.txt".to_owned(),
            mode: EntryMode::Blob,
            oid: blob,
        }])
        .unwrap();
    repo.create_commit(tree, parents, msg, None).unwrap()
}

fn create(name: &RefName, new: GitOid) -> RefEdit {
    RefEdit {
        name: name.clone(),
        expected_old: GitOid::ZERO,
        new,
    }
}

// ===========================================================================
// Objects
// ===========================================================================

#[test]
fn blob_and_commit_roundtrip() {
    let (_dir, repo) = setup_repo();
    let c1 = commit(&repo, &[], "first");
    let info = repo.read_commit(c1).unwrap();
    assert!(info.parents.is_empty());
    assert_eq!(info.message, "first");
    assert_eq!(info.author.email, "test@test.com");
    let entries = repo.read_tree(info.tree_oid).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(repo.read_blob(entries[0].oid).unwrap(), b"first");
}

#[test]
fn commit_author_override() {
    let (_dir, repo) = setup_repo();
    let tree = repo.write_tree(&[]).unwrap();
    let who = PersonIdent::new("Change Owner", "owner@example.com");
    let c = repo.create_commit(tree, &[], "update", Some(&who)).unwrap();
    let info = repo.read_commit(c).unwrap();
    assert_eq!(info.author, who);
    assert_eq!(info.committer, who);
}

#[test]
fn ancestry() {
    let (_dir, repo) = setup_repo();
    let c1 = commit(&repo, &[], "one");
    let c2 = commit(&repo, &[c1], "two");
    assert!(repo.is_ancestor(c1, c2).unwrap());
    assert!(!repo.is_ancestor(c2, c1).unwrap());
}

// ===========================================================================
// Ref transactions
// ===========================================================================

#[test]
fn atomic_create_update_delete() {
    let (_dir, repo) = setup_repo();
    let c1 = commit(&repo, &[], "one");
    let c2 = commit(&repo, &[c1], "two");
    let main = name("refs/heads/main");
    let meta = name("refs/changes/01/1/meta");
    let log = RefLog::message("test");

    repo.atomic_ref_update(&[create(&main, c1), create(&meta, c1)], &log)
        .unwrap();
    assert_eq!(repo.read_ref(&main).unwrap(), Some(c1));

    repo.atomic_ref_update(
        &[RefEdit {
            name: main.clone(),
            expected_old: c1,
            new: c2,
        }],
        &log,
    )
    .unwrap();
    assert_eq!(repo.read_ref(&main).unwrap(), Some(c2));

    repo.atomic_ref_update(
        &[RefEdit {
            name: meta.clone(),
            expected_old: c1,
            new: GitOid::ZERO,
        }],
        &log,
    )
    .unwrap();
    assert!(repo.read_ref(&meta).unwrap().is_none());
}

#[test]
fn stale_expectation_is_ref_conflict_and_nothing_moves() {
    let (_dir, repo) = setup_repo();
    let c1 = commit(&repo, &[], "one");
    let c2 = commit(&repo, &[c1], "two");
    let main = name("refs/heads/main");
    let other = name("refs/heads/other");
    let log = RefLog::message("test");
    repo.atomic_ref_update(&[create(&main, c1)], &log).unwrap();

    let err = repo
        .atomic_ref_update(&[create(&other, c2), create(&main, c2)], &log)
        .unwrap_err();
    assert!(matches!(err, GitError::RefConflict { .. }), "{err}");
    assert!(repo.read_ref(&other).unwrap().is_none());
    assert_eq!(repo.read_ref(&main).unwrap(), Some(c1));
}

#[test]
fn list_refs_by_prefix() {
    let (_dir, repo) = setup_repo();
    let c1 = commit(&repo, &[], "one");
    let log = RefLog::message("test");
    repo.atomic_ref_update(
        &[
            create(&name("refs/changes/01/1/meta"), c1),
            create(&name("refs/changes/01/1/1"), c1),
            create(&name("refs/heads/main"), c1),
        ],
        &log,
    )
    .unwrap();
    let refs = repo.list_refs("refs/changes/01/1/").unwrap();
    let names: Vec<_> = refs.iter().map(|(n, _)| n.as_str().to_owned()).collect();
    assert_eq!(names, vec!["refs/changes/01/1/1", "refs/changes/01/1/meta"]);
}

// ===========================================================================
// Store
// ===========================================================================

#[test]
fn fs_store_opens_bare_projects() {
    let base = TempDir::new().unwrap();
    init_bare(&base.path().join("platform/core.git"));
    init_bare(&base.path().join("All-Users.git"));

    let store = FsRepositoryStore::new(base.path());
    let projects = store.list_projects().unwrap();
    let names: Vec<_> = projects.iter().map(|p| p.as_str().to_owned()).collect();
    assert_eq!(names, vec!["All-Users", "platform/core"]);

    let repo = store
        .open_repository(&ProjectName::new("platform/core").unwrap())
        .unwrap();
    assert!(repo.list_refs("refs/").unwrap().is_empty());
}

// ===========================================================================
// Sharing
// ===========================================================================

#[test]
fn one_handle_serves_worker_threads() {
    fn assert_shareable<T: Send + Sync>() {}
    assert_shareable::<GixRepo>();
    assert_shareable::<FsRepositoryStore>();

    let (_dir, repo) = setup_repo();
    let base = commit(&repo, &[], "base");
    let log = RefLog::message("workers");
    let refs: Vec<RefName> = (1..=4)
        .map(|i| name(&format!("refs/changes/0{i}/{i}/meta")))
        .collect();
    let handle = &repo;
    let shared: &dyn GitRepo = &repo;
    let log = &log;

    std::thread::scope(|s| {
        for r in &refs {
            s.spawn(move || {
                let tip = commit(handle, &[base], r.as_str());
                shared.atomic_ref_update(&[create(r, tip)], log).unwrap();
            });
        }
    });

    for r in &refs {
        let tip = repo.read_ref(r).unwrap().unwrap();
        assert_eq!(repo.read_commit(tip).unwrap().message, r.as_str());
    }
}
