//! In-memory [`GitRepo`] with fault injection.
//!
//! `MemRepo` keeps refs and objects in process memory. Object ids are
//! content hashes, so writing the same object twice yields the same id, just
//! like a real object database. Tests use the fault hooks to simulate
//! concurrent writers (lock failures) and broken storage (I/O failures).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, GitOid, PersonIdent, RefEdit, RefLog, RefName, TreeEntry};

/// One reflog record written by a successful transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflogRecord {
    /// The ref that moved.
    pub ref_name: RefName,
    /// Previous value (zero for a create).
    pub old: GitOid,
    /// New value (zero for a delete).
    pub new: GitOid,
    /// Reflog message of the transaction.
    pub message: String,
    /// Identity recorded for the transaction, if one was supplied.
    pub ident: Option<PersonIdent>,
}

#[derive(Clone, Debug)]
enum Object {
    Blob(Vec<u8>),
    Tree(Vec<TreeEntry>),
    Commit(CommitInfo),
}

#[derive(Default)]
struct MemState {
    refs: BTreeMap<RefName, GitOid>,
    objects: HashMap<GitOid, Object>,
    reflog: Vec<ReflogRecord>,
}

/// A [`GitRepo`] kept entirely in memory.
pub struct MemRepo {
    state: Mutex<MemState>,
    identity: PersonIdent,
    injected_lock_failures: AtomicUsize,
    injected_io_failure: AtomicBool,
    transactions_attempted: AtomicUsize,
    transactions_committed: AtomicUsize,
    flushes: AtomicUsize,
}

impl Default for MemRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRepo {
    /// An empty repository whose configured identity is a server account.
    #[must_use]
    pub fn new() -> Self {
        Self::with_identity(PersonIdent::new("Refbatch Server", "server@refbatch.invalid"))
    }

    /// An empty repository with the given configured identity.
    #[must_use]
    pub fn with_identity(identity: PersonIdent) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            identity,
            injected_lock_failures: AtomicUsize::new(0),
            injected_io_failure: AtomicBool::new(false),
            transactions_attempted: AtomicUsize::new(0),
            transactions_committed: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemState>, GitError> {
        self.state
            .lock()
            .map_err(|_| GitError::backend("in-memory repository state poisoned"))
    }

    // -- fault injection --

    /// Make the next `n` ref transactions fail with a lock failure without
    /// touching any ref.
    pub fn inject_lock_failures(&self, n: usize) {
        self.injected_lock_failures.store(n, Ordering::SeqCst);
    }

    /// Make every ref transaction fail with an I/O error until cleared.
    pub fn set_io_failure(&self, failing: bool) {
        self.injected_io_failure.store(failing, Ordering::SeqCst);
    }

    /// Move a ref directly, bypassing transactions, as a concurrent writer
    /// would. `GitOid::ZERO` removes the ref.
    ///
    /// # Errors
    /// Returns a backend error if the state lock is poisoned.
    pub fn force_ref(&self, name: &RefName, oid: GitOid) -> Result<(), GitError> {
        let mut state = self.state()?;
        if oid.is_zero() {
            state.refs.remove(name);
        } else {
            state.refs.insert(name.clone(), oid);
        }
        Ok(())
    }

    // -- inspection --

    /// Number of ref transactions attempted, including failed ones.
    #[must_use]
    pub fn transactions_attempted(&self) -> usize {
        self.transactions_attempted.load(Ordering::SeqCst)
    }

    /// Number of ref transactions that changed the ref database.
    #[must_use]
    pub fn transactions_committed(&self) -> usize {
        self.transactions_committed.load(Ordering::SeqCst)
    }

    /// Number of object flushes requested.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// All reflog records, oldest first.
    ///
    /// # Errors
    /// Returns a backend error if the state lock is poisoned.
    pub fn reflog(&self) -> Result<Vec<ReflogRecord>, GitError> {
        Ok(self.state()?.reflog.clone())
    }

    /// Snapshot of every ref.
    ///
    /// # Errors
    /// Returns a backend error if the state lock is poisoned.
    pub fn refs(&self) -> Result<BTreeMap<RefName, GitOid>, GitError> {
        Ok(self.state()?.refs.clone())
    }

    fn store(&self, kind: &str, payload: &[u8], object: Object) -> Result<GitOid, GitError> {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        let oid = GitOid::from_bytes(bytes);
        self.state()?.objects.entry(oid).or_insert(object);
        Ok(oid)
    }

    fn object(&self, oid: GitOid, kind: &str) -> Result<Object, GitError> {
        self.state()?
            .objects
            .get(&oid)
            .cloned()
            .ok_or_else(|| GitError::NotFound {
                message: format!("{kind} {oid}"),
            })
    }
}

impl GitRepo for MemRepo {
    fn read_ref(&self, name: &RefName) -> Result<Option<GitOid>, GitError> {
        Ok(self.state()?.refs.get(name).copied())
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, GitOid)>, GitError> {
        Ok(self
            .state()?
            .refs
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(prefix))
            .map(|(name, oid)| (name.clone(), *oid))
            .collect())
    }

    fn atomic_ref_update(&self, edits: &[RefEdit], reflog: &RefLog) -> Result<(), GitError> {
        self.transactions_attempted.fetch_add(1, Ordering::SeqCst);
        if self.injected_io_failure.load(Ordering::SeqCst) {
            return Err(GitError::backend("injected I/O failure"));
        }
        if edits.is_empty() {
            return Ok(());
        }
        let injected = self
            .injected_lock_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(GitError::RefConflict {
                ref_name: edits[0].name.to_string(),
                message: "injected lock failure".to_owned(),
            });
        }

        let mut state = self.state()?;
        for edit in edits {
            let current = state.refs.get(&edit.name).copied().unwrap_or(GitOid::ZERO);
            if current != edit.expected_old {
                return Err(GitError::RefConflict {
                    ref_name: edit.name.to_string(),
                    message: format!("expected {}, found {}", edit.expected_old, current),
                });
            }
        }
        for edit in edits {
            if edit.is_delete() {
                state.refs.remove(&edit.name);
            } else {
                state.refs.insert(edit.name.clone(), edit.new);
            }
            state.reflog.push(ReflogRecord {
                ref_name: edit.name.clone(),
                old: edit.expected_old,
                new: edit.new,
                message: reflog.message.clone(),
                ident: reflog.ident.clone(),
            });
        }
        self.transactions_committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        match self.object(oid, "blob")? {
            Object::Blob(data) => Ok(data),
            _ => Err(GitError::NotFound {
                message: format!("{oid} is not a blob"),
            }),
        }
    }

    fn read_tree(&self, oid: GitOid) -> Result<Vec<TreeEntry>, GitError> {
        match self.object(oid, "tree")? {
            Object::Tree(entries) => Ok(entries),
            _ => Err(GitError::NotFound {
                message: format!("{oid} is not a tree"),
            }),
        }
    }

    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        match self.object(oid, "commit")? {
            Object::Commit(info) => Ok(info),
            _ => Err(GitError::NotFound {
                message: format!("{oid} is not a commit"),
            }),
        }
    }

    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError> {
        self.store("blob", data, Object::Blob(data.to_vec()))
    }

    fn write_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, GitError> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut payload = Vec::new();
        for entry in &sorted {
            payload.extend_from_slice(format!("{:?} {}\0", entry.mode, entry.name).as_bytes());
            payload.extend_from_slice(entry.oid.as_bytes());
        }
        self.store("tree", &payload, Object::Tree(sorted))
    }

    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: Option<&PersonIdent>,
    ) -> Result<GitOid, GitError> {
        let ident = author.cloned().unwrap_or_else(|| self.identity.clone());
        let mut payload = format!("tree {tree}\n");
        for parent in parents {
            payload.push_str(&format!("parent {parent}\n"));
        }
        payload.push_str(&format!("author {ident}\n\n{message}"));
        let info = CommitInfo {
            tree_oid: tree,
            parents: parents.to_vec(),
            message: message.to_owned(),
            author: ident.clone(),
            committer: ident,
        };
        self.store("commit", payload.as_bytes(), Object::Commit(info))
    }

    fn flush_objects(&self) -> Result<(), GitError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ancestor(&self, ancestor: GitOid, descendant: GitOid) -> Result<bool, GitError> {
        let mut stack = vec![descendant];
        let mut seen = std::collections::HashSet::new();
        while let Some(oid) = stack.pop() {
            if oid == ancestor {
                return Ok(true);
            }
            if !seen.insert(oid) {
                continue;
            }
            if let Object::Commit(info) = self.object(oid, "commit")? {
                stack.extend(info.parents);
            }
        }
        Ok(false)
    }
}
