//! gix-backed ref reads, atomic ref transactions, and ancestry.

use gix::refs::transaction::{Change, LogChange, PreviousValue, RefLog as LogMode};
use gix::refs::{FullName, Target};

use crate::error::GitError;
use crate::gix_repo::{from_gix_oid, to_gix_oid};
use crate::types::{GitOid, RefEdit, RefLog, RefName};

/// Substrings of gix transaction errors that signal a precondition mismatch
/// or a held lock rather than an I/O failure.
const CONFLICT_MARKERS: &[&str] = &[
    "should have content",
    "supposed to",
    "should not exist",
    "must not exist",
    "mustnotexist",
    "mustexistandmatch",
    "did not exist",
    "did not match",
    "out of date",
    "outofdate",
    "already exists",
    "existing object id",
    "lock could not be obtained",
];

pub fn read_ref(repo: &gix::Repository, name: &RefName) -> Result<Option<GitOid>, GitError> {
    match repo.try_find_reference(name.as_str()) {
        Ok(Some(mut r)) => {
            let id = r.peel_to_id_in_place().map_err(GitError::backend)?;
            Ok(Some(from_gix_oid(id.as_ref())?))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(GitError::backend(e)),
    }
}

pub fn list_refs(repo: &gix::Repository, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
    let platform = repo.references().map_err(GitError::backend)?;
    let refs_iter = platform.prefixed(prefix).map_err(GitError::backend)?;

    let mut result = Vec::new();
    for r in refs_iter {
        let mut r = r.map_err(GitError::backend)?;
        let name = r.name().as_bstr().to_string();
        let id = r.peel_to_id_in_place().map_err(GitError::backend)?;
        if let Ok(ref_name) = RefName::new(&name) {
            result.push((ref_name, from_gix_oid(id.as_ref())?));
        }
    }
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

fn to_gix_edit(edit: &RefEdit, message: &str) -> Result<gix::refs::transaction::RefEdit, GitError> {
    let name: FullName = edit
        .name
        .as_str()
        .try_into()
        .map_err(|e: gix::validate::reference::name::Error| GitError::backend(e))?;

    let expected = if edit.expected_old.is_zero() {
        PreviousValue::MustNotExist
    } else {
        PreviousValue::MustExistAndMatch(Target::Object(to_gix_oid(edit.expected_old)))
    };

    let change = if edit.is_delete() {
        if edit.expected_old.is_zero() {
            return Err(GitError::backend(format!(
                "cannot delete {} without an expected old value",
                edit.name
            )));
        }
        Change::Delete {
            expected,
            log: LogMode::AndReference,
        }
    } else {
        Change::Update {
            log: LogChange {
                mode: LogMode::AndReference,
                force_create_reflog: false,
                message: message.into(),
            },
            expected,
            new: Target::Object(to_gix_oid(edit.new)),
        }
    };

    Ok(gix::refs::transaction::RefEdit {
        change,
        name,
        deref: false,
    })
}

/// Apply `edits` as one gix ref transaction.
///
/// The reflog identity comes from the repository's committer configuration;
/// `reflog.ident` is recorded by in-memory stores only.
pub fn atomic_ref_update(
    repo: &gix::Repository,
    edits: &[RefEdit],
    reflog: &RefLog,
) -> Result<(), GitError> {
    if edits.is_empty() {
        return Ok(());
    }
    let gix_edits = edits
        .iter()
        .map(|edit| to_gix_edit(edit, &reflog.message))
        .collect::<Result<Vec<_>, GitError>>()?;

    repo.edit_references(gix_edits).map_err(|e| {
        let msg = e.to_string();
        let lowered = msg.to_lowercase();
        if CONFLICT_MARKERS.iter().any(|m| lowered.contains(m)) {
            let ref_name = edits
                .iter()
                .find(|edit| msg.contains(edit.name.as_str()))
                .or_else(|| edits.first())
                .map(|edit| edit.name.as_str().to_owned())
                .unwrap_or_default();
            GitError::RefConflict {
                ref_name,
                message: msg,
            }
        } else {
            GitError::BackendError { message: msg }
        }
    })?;
    tracing::trace!(edits = edits.len(), message = %reflog.message, "ref transaction committed");
    Ok(())
}

pub fn is_ancestor(
    repo: &gix::Repository,
    ancestor: GitOid,
    descendant: GitOid,
) -> Result<bool, GitError> {
    if ancestor == descendant {
        return Ok(true);
    }

    let ancestor_gix = to_gix_oid(ancestor);
    let walk = repo
        .rev_walk([to_gix_oid(descendant)])
        .all()
        .map_err(GitError::backend)?;

    for info in walk {
        let info = info.map_err(GitError::backend)?;
        if info.id == ancestor_gix {
            return Ok(true);
        }
    }
    Ok(false)
}
