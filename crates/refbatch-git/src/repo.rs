//! The [`GitRepo`] trait: the only way the batch update engine touches a
//! repository.
//!
//! The trait is object-safe; the engine holds repositories as
//! `Arc<dyn GitRepo>` so that a store can hand out independent handles to
//! worker threads.
//!
//! | Group        | Methods                                          |
//! |--------------|--------------------------------------------------|
//! | Refs         | `read_ref`, `list_refs`, `atomic_ref_update`     |
//! | Object read  | `read_blob`, `read_tree`, `read_commit`          |
//! | Object write | `write_blob`, `write_tree`, `create_commit`      |
//! | Ancestry     | `is_ancestor`                                    |

use crate::error::GitError;
use crate::types::{CommitInfo, GitOid, PersonIdent, RefEdit, RefLog, RefName, TreeEntry};

/// Ref and object access for one repository.
pub trait GitRepo: Send + Sync {
    // === Refs ===

    /// Resolve a ref to the object it points at, `None` if it does not exist.
    ///
    /// # Errors
    /// Returns a backend error if the ref database cannot be read.
    fn read_ref(&self, name: &RefName) -> Result<Option<GitOid>, GitError>;

    /// List every ref whose full name starts with `prefix`.
    ///
    /// Names are returned fully qualified, sorted by name.
    ///
    /// # Errors
    /// Returns a backend error if the ref database cannot be scanned.
    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError>;

    /// Apply all `edits` in one all-or-nothing transaction.
    ///
    /// Every edit is compare-and-swap against its `expected_old` value. If any
    /// edit's precondition fails, no ref is changed and
    /// [`GitError::RefConflict`] names the offending ref.
    ///
    /// # Errors
    /// `RefConflict` on a precondition mismatch, `BackendError` otherwise.
    fn atomic_ref_update(&self, edits: &[RefEdit], reflog: &RefLog) -> Result<(), GitError>;

    // === Object read ===

    /// Read a blob's contents.
    ///
    /// # Errors
    /// `NotFound` if the blob does not exist.
    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError>;

    /// Read a tree's entries.
    ///
    /// # Errors
    /// `NotFound` if the tree does not exist.
    fn read_tree(&self, oid: GitOid) -> Result<Vec<TreeEntry>, GitError>;

    /// Read a commit's metadata.
    ///
    /// # Errors
    /// `NotFound` if the commit does not exist.
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError>;

    // === Object write ===

    /// Store a blob and return its OID.
    ///
    /// # Errors
    /// Returns a backend error if the object cannot be written.
    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError>;

    /// Store a tree built from `entries` and return its OID.
    ///
    /// # Errors
    /// Returns a backend error if the object cannot be written.
    fn write_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, GitError>;

    /// Store a commit object. No ref is moved.
    ///
    /// `author` overrides the configured identity for both author and
    /// committer; `None` uses the repository's configured identity.
    ///
    /// # Errors
    /// Returns a backend error if no identity is available or the object
    /// cannot be written.
    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: Option<&PersonIdent>,
    ) -> Result<GitOid, GitError>;

    /// Make objects written so far durable.
    ///
    /// Backends that write objects straight to the object database need not
    /// override this.
    ///
    /// # Errors
    /// Returns a backend error if pending objects cannot be persisted.
    fn flush_objects(&self) -> Result<(), GitError> {
        Ok(())
    }

    // === Ancestry ===

    /// `true` if `ancestor` is reachable from `descendant` (or equal to it).
    ///
    /// # Errors
    /// Returns a backend error if history cannot be walked.
    fn is_ancestor(&self, ancestor: GitOid, descendant: GitOid) -> Result<bool, GitError>;
}
