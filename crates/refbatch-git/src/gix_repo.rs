//! The gix-backed implementation of [`GitRepo`].

use std::path::{Path, PathBuf};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, GitOid, PersonIdent, RefEdit, RefLog, RefName, TreeEntry};

/// A [`GitRepo`] implementation backed by [gix](https://github.com/GitoxideLabs/gitoxide).
///
/// Holds a thread-safe handle; every call works on a fresh thread-local
/// repository so one `GixRepo` can be shared across worker threads.
pub struct GixRepo {
    pub(crate) repo: gix::ThreadSafeRepository,
    path: PathBuf,
}

impl GixRepo {
    /// Open the repository (bare or not) at `path`.
    ///
    /// # Errors
    /// Returns a backend error if `path` is not a git repository.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let repo = gix::open(path).map_err(GitError::backend)?;
        Ok(Self {
            repo: repo.into_sync(),
            path: path.to_path_buf(),
        })
    }

    /// The path this repository was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn local(&self) -> gix::Repository {
        self.repo.to_thread_local()
    }
}

impl std::fmt::Debug for GixRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GixRepo").field("path", &self.path).finish()
    }
}

pub(crate) fn to_gix_oid(oid: GitOid) -> gix::ObjectId {
    gix::ObjectId::from(*oid.as_bytes())
}

pub(crate) fn from_gix_oid(oid: &gix::oid) -> Result<GitOid, GitError> {
    let bytes: [u8; 20] = oid.as_bytes().try_into().map_err(|_| GitError::InvalidOid {
        value: oid.to_string(),
        reason: "only SHA-1 object ids are supported".to_owned(),
    })?;
    Ok(GitOid::from_bytes(bytes))
}

impl GitRepo for GixRepo {
    fn read_ref(&self, name: &RefName) -> Result<Option<GitOid>, GitError> {
        crate::refs_impl::read_ref(&self.local(), name)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
        crate::refs_impl::list_refs(&self.local(), prefix)
    }

    fn atomic_ref_update(&self, edits: &[RefEdit], reflog: &RefLog) -> Result<(), GitError> {
        crate::refs_impl::atomic_ref_update(&self.local(), edits, reflog)
    }

    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        crate::objects_impl::read_blob(&self.local(), oid)
    }

    fn read_tree(&self, oid: GitOid) -> Result<Vec<TreeEntry>, GitError> {
        crate::objects_impl::read_tree(&self.local(), oid)
    }

    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        crate::objects_impl::read_commit(&self.local(), oid)
    }

    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError> {
        crate::objects_impl::write_blob(&self.local(), data)
    }

    fn write_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, GitError> {
        crate::objects_impl::write_tree(&self.local(), entries)
    }

    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: Option<&PersonIdent>,
    ) -> Result<GitOid, GitError> {
        crate::objects_impl::create_commit(&self.local(), tree, parents, message, author)
    }

    fn is_ancestor(&self, ancestor: GitOid, descendant: GitOid) -> Result<bool, GitError> {
        crate::refs_impl::is_ancestor(&self.local(), ancestor, descendant)
    }
}
