//! gix-backed object reads and writes.

use crate::error::GitError;
use crate::gix_repo::{from_gix_oid, to_gix_oid};
use crate::types::{CommitInfo, EntryMode, GitOid, PersonIdent, TreeEntry};

fn from_gix_entry_mode(mode: gix::objs::tree::EntryMode) -> EntryMode {
    match mode.kind() {
        gix::objs::tree::EntryKind::Tree => EntryMode::Tree,
        gix::objs::tree::EntryKind::Blob => EntryMode::Blob,
        gix::objs::tree::EntryKind::BlobExecutable => EntryMode::BlobExecutable,
        gix::objs::tree::EntryKind::Link => EntryMode::Link,
        gix::objs::tree::EntryKind::Commit => EntryMode::Commit,
    }
}

const fn to_gix_entry_kind(mode: EntryMode) -> gix::objs::tree::EntryKind {
    match mode {
        EntryMode::Blob => gix::objs::tree::EntryKind::Blob,
        EntryMode::BlobExecutable => gix::objs::tree::EntryKind::BlobExecutable,
        EntryMode::Tree => gix::objs::tree::EntryKind::Tree,
        EntryMode::Link => gix::objs::tree::EntryKind::Link,
        EntryMode::Commit => gix::objs::tree::EntryKind::Commit,
    }
}

fn ident_of(name: &gix::bstr::BStr, email: &gix::bstr::BStr) -> PersonIdent {
    PersonIdent::new(name.to_string(), email.to_string())
}

pub fn read_blob(repo: &gix::Repository, oid: GitOid) -> Result<Vec<u8>, GitError> {
    let mut blob = repo.find_blob(to_gix_oid(oid)).map_err(|e| GitError::NotFound {
        message: format!("blob {oid}: {e}"),
    })?;
    Ok(blob.take_data())
}

pub fn read_tree(repo: &gix::Repository, oid: GitOid) -> Result<Vec<TreeEntry>, GitError> {
    let tree = repo.find_tree(to_gix_oid(oid)).map_err(|e| GitError::NotFound {
        message: format!("tree {oid}: {e}"),
    })?;

    let mut entries = Vec::new();
    for result in tree.iter() {
        let entry = result.map_err(|e| GitError::backend(format!("failed to decode tree entry: {e}")))?;
        entries.push(TreeEntry {
            name: entry.inner.filename.to_string(),
            mode: from_gix_entry_mode(entry.inner.mode),
            oid: from_gix_oid(entry.inner.oid)?,
        });
    }
    Ok(entries)
}

pub fn read_commit(repo: &gix::Repository, oid: GitOid) -> Result<CommitInfo, GitError> {
    let commit = repo.find_commit(to_gix_oid(oid)).map_err(|e| GitError::NotFound {
        message: format!("commit {oid}: {e}"),
    })?;
    let decoded = commit
        .decode()
        .map_err(|e| GitError::backend(format!("failed to decode commit {oid}: {e}")))?;

    let parents = decoded
        .parents()
        .map(|p| from_gix_oid(&p))
        .collect::<Result<Vec<_>, _>>()?;
    let author = decoded.author();
    let committer = decoded.committer();

    Ok(CommitInfo {
        tree_oid: from_gix_oid(&decoded.tree())?,
        parents,
        message: decoded.message.to_string(),
        author: ident_of(author.name, author.email),
        committer: ident_of(committer.name, committer.email),
    })
}

pub fn write_blob(repo: &gix::Repository, data: &[u8]) -> Result<GitOid, GitError> {
    let id = repo
        .write_blob(data)
        .map_err(|e| GitError::backend(format!("failed to write blob: {e}")))?;
    from_gix_oid(id.as_ref())
}

pub fn write_tree(repo: &gix::Repository, entries: &[TreeEntry]) -> Result<GitOid, GitError> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let tree = gix::objs::Tree {
        entries: sorted
            .into_iter()
            .map(|e| gix::objs::tree::Entry {
                mode: to_gix_entry_kind(e.mode).into(),
                filename: e.name.as_str().into(),
                oid: to_gix_oid(e.oid),
            })
            .collect(),
    };
    let id = repo
        .write_object(&tree)
        .map_err(|e| GitError::backend(format!("failed to write tree: {e}")))?;
    from_gix_oid(id.as_ref())
}

pub fn create_commit(
    repo: &gix::Repository,
    tree: GitOid,
    parents: &[GitOid],
    message: &str,
    author: Option<&PersonIdent>,
) -> Result<GitOid, GitError> {
    let configured = repo
        .committer()
        .ok_or_else(|| GitError::backend("no committer identity configured"))?
        .map_err(|e| GitError::backend(format!("failed to read committer identity: {e}")))?;

    let mut signature: gix::actor::Signature = configured.into();
    if let Some(ident) = author {
        signature.name = ident.name.as_str().into();
        signature.email = ident.email.as_str().into();
    }

    let commit = gix::objs::Commit {
        message: message.into(),
        tree: to_gix_oid(tree),
        author: signature.clone(),
        committer: signature,
        encoding: None,
        parents: parents.iter().map(|p| to_gix_oid(*p)).collect(),
        extra_headers: Vec::new(),
    };
    let id = repo
        .write_object(&commit)
        .map_err(|e| GitError::backend(format!("failed to write commit object: {e}")))?;
    from_gix_oid(id.as_ref())
}
