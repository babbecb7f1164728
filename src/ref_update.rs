//! Ref-update commands and the batch that executes them.
//!
//! A [`ReceiveCommand`] is one staged compare-and-swap on a ref. A
//! [`BatchRefUpdate`] executes a list of them against a repository, either
//! atomically (one transaction; any failure leaves every ref untouched) or
//! command by command, and records a [`CommandResult`] per command.

use std::collections::BTreeMap;
use std::fmt;

use refbatch_git::{GitError, GitOid, GitRepo, PersonIdent, RefEdit, RefLog, RefName};

use crate::change::{ChangeId, REFS_CHANGES};
use crate::error::UpdateError;

/// Reflog message used when none was set.
pub const DEFAULT_REF_LOG_MESSAGE: &str = "Update refs";

// ---------------------------------------------------------------------------
// ReceiveCommand
// ---------------------------------------------------------------------------

/// Outcome of one command after its batch executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandResult {
    /// Not executed (yet, or the batch was refused as a whole).
    #[default]
    NotAttempted,
    /// The ref was moved.
    Ok,
    /// The ref did not hold the expected old value.
    LockFailure,
    /// The update was not a fast-forward and those were not allowed.
    RejectedNonFastForward,
    /// Rejected for another reason, typically an aborted atomic batch.
    RejectedOther,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotAttempted => "NOT_ATTEMPTED",
            Self::Ok => "OK",
            Self::LockFailure => "LOCK_FAILURE",
            Self::RejectedNonFastForward => "REJECTED_NONFASTFORWARD",
            Self::RejectedOther => "REJECTED_OTHER_REASON",
        };
        f.write_str(s)
    }
}

/// What a command does to its ref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// The ref does not exist yet.
    Create,
    /// The ref moves from one object to another.
    Update,
    /// The ref is removed.
    Delete,
}

/// A staged update of a single ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveCommand {
    ref_name: String,
    old: GitOid,
    new: GitOid,
    result: CommandResult,
    message: Option<String>,
}

impl ReceiveCommand {
    /// A command moving `ref_name` from `old` to `new`; zero ids mean
    /// "absent".
    #[must_use]
    pub fn new(ref_name: impl Into<String>, old: GitOid, new: GitOid) -> Self {
        Self {
            ref_name: ref_name.into(),
            old,
            new,
            result: CommandResult::NotAttempted,
            message: None,
        }
    }

    /// Create `ref_name` pointing at `new`.
    #[must_use]
    pub fn create(ref_name: impl Into<String>, new: GitOid) -> Self {
        Self::new(ref_name, GitOid::ZERO, new)
    }

    /// Delete `ref_name`, currently at `old`.
    #[must_use]
    pub fn delete(ref_name: impl Into<String>, old: GitOid) -> Self {
        Self::new(ref_name, old, GitOid::ZERO)
    }

    /// Full ref name.
    #[must_use]
    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    /// Expected current value; zero if the ref must not exist.
    #[must_use]
    pub const fn old_id(&self) -> GitOid {
        self.old
    }

    /// Value to set; zero to delete.
    #[must_use]
    pub const fn new_id(&self) -> GitOid {
        self.new
    }

    /// Result of the last execution.
    #[must_use]
    pub const fn result(&self) -> CommandResult {
        self.result
    }

    /// Message attached to a non-OK result.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Create, update, or delete.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        if self.old.is_zero() {
            CommandKind::Create
        } else if self.new.is_zero() {
            CommandKind::Delete
        } else {
            CommandKind::Update
        }
    }

    /// `true` if executing the command would not move the ref.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }

    pub(crate) fn set_new_id(&mut self, new: GitOid) {
        self.new = new;
    }

    fn set_result(&mut self, result: CommandResult, message: Option<String>) {
        self.result = result;
        self.message = message;
    }

    fn to_edit(&self) -> Result<RefEdit, UpdateError> {
        let name = RefName::new(&self.ref_name)
            .map_err(|e| UpdateError::BadRequest(e.to_string()))?;
        Ok(RefEdit {
            name,
            expected_old: self.old,
            new: self.new,
        })
    }
}

impl fmt::Display for ReceiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}..{} {}",
            self.ref_name,
            self.old.short(),
            self.new.short(),
            self.result
        )
    }
}

// ---------------------------------------------------------------------------
// BatchRefUpdate
// ---------------------------------------------------------------------------

/// A list of ref commands executed together.
#[derive(Clone, Debug, Default)]
pub struct BatchRefUpdate {
    commands: Vec<ReceiveCommand>,
    atomic: bool,
    allow_non_fast_forwards: bool,
    ref_log_message: Option<String>,
    ref_log_ident: Option<PersonIdent>,
    push_certificate: Option<String>,
    executed: bool,
}

impl BatchRefUpdate {
    /// An empty atomic batch that refuses non-fast-forwards.
    #[must_use]
    pub fn new() -> Self {
        Self {
            atomic: true,
            ..Self::default()
        }
    }

    /// Add a command.
    pub fn add_command(&mut self, cmd: ReceiveCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    /// Execute as one transaction (default) or command by command.
    pub const fn set_atomic(&mut self, atomic: bool) -> &mut Self {
        self.atomic = atomic;
        self
    }

    /// Permit updates that are not fast-forwards.
    pub const fn set_allow_non_fast_forwards(&mut self, allow: bool) -> &mut Self {
        self.allow_non_fast_forwards = allow;
        self
    }

    /// Reflog message for every moved ref.
    pub fn set_ref_log_message(&mut self, message: Option<String>) -> &mut Self {
        self.ref_log_message = message;
        self
    }

    /// Reflog identity for every moved ref.
    pub fn set_ref_log_ident(&mut self, ident: Option<PersonIdent>) -> &mut Self {
        self.ref_log_ident = ident;
        self
    }

    /// Signed push certificate accompanying the update.
    pub fn set_push_certificate(&mut self, cert: Option<String>) -> &mut Self {
        self.push_certificate = cert;
        self
    }

    /// Commands with their results.
    #[must_use]
    pub fn commands(&self) -> &[ReceiveCommand] {
        &self.commands
    }

    /// `true` if this batch runs as one transaction.
    #[must_use]
    pub const fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Reflog message, if set.
    #[must_use]
    pub fn ref_log_message(&self) -> Option<&str> {
        self.ref_log_message.as_deref()
    }

    /// Reflog identity, if set.
    #[must_use]
    pub const fn ref_log_ident(&self) -> Option<&PersonIdent> {
        self.ref_log_ident.as_ref()
    }

    /// Push certificate, if any.
    #[must_use]
    pub fn push_certificate(&self) -> Option<&str> {
        self.push_certificate.as_deref()
    }

    /// `true` once `execute` has been called.
    #[must_use]
    pub const fn is_executed(&self) -> bool {
        self.executed
    }

    /// `true` if there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// `true` if every command succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.commands.iter().all(|c| c.result == CommandResult::Ok)
    }

    fn ref_log(&self) -> RefLog {
        RefLog {
            message: self
                .ref_log_message
                .clone()
                .unwrap_or_else(|| DEFAULT_REF_LOG_MESSAGE.to_owned()),
            ident: self.ref_log_ident.clone(),
        }
    }

    /// Execute every command against `repo` and record per-command results.
    ///
    /// # Errors
    /// - `LockFailure` if any ref no longer held its expected value. In an
    ///   atomic batch the failing command is marked `LockFailure` and the
    ///   rest `RejectedOther`; nothing moved.
    /// - `RefUpdateRejected` for a refused non-fast-forward.
    /// - `Usage` for a non-atomic batch touching more than one ref of a
    ///   single change; nothing is attempted.
    /// - `Storage` for any other backend failure.
    pub fn execute(&mut self, repo: &dyn GitRepo) -> Result<(), UpdateError> {
        self.executed = true;
        if self.commands.is_empty() {
            return Ok(());
        }
        if !self.atomic {
            check_one_ref_per_change(&self.commands)?;
        }
        if !self.allow_non_fast_forwards {
            self.reject_non_fast_forwards(repo)?;
        }
        if self.atomic {
            self.execute_atomic(repo)
        } else {
            self.execute_each(repo)
        }
    }

    fn reject_non_fast_forwards(&mut self, repo: &dyn GitRepo) -> Result<(), UpdateError> {
        let mut rejected = None;
        for (i, cmd) in self.commands.iter().enumerate() {
            if cmd.kind() == CommandKind::Update && !repo.is_ancestor(cmd.old, cmd.new)? {
                rejected = Some(i);
                break;
            }
        }
        let Some(idx) = rejected else {
            return Ok(());
        };
        let name = self.commands[idx].ref_name.clone();
        for (i, cmd) in self.commands.iter_mut().enumerate() {
            if i == idx {
                cmd.set_result(CommandResult::RejectedNonFastForward, None);
            } else if self.atomic {
                cmd.set_result(
                    CommandResult::RejectedOther,
                    Some("transaction aborted".to_owned()),
                );
            }
        }
        Err(UpdateError::RefUpdateRejected(format!(
            "non-fast-forward update of {name} rejected"
        )))
    }

    fn execute_atomic(&mut self, repo: &dyn GitRepo) -> Result<(), UpdateError> {
        let edits = self
            .commands
            .iter()
            .filter(|c| !c.is_noop())
            .map(ReceiveCommand::to_edit)
            .collect::<Result<Vec<_>, _>>()?;
        match repo.atomic_ref_update(&edits, &self.ref_log()) {
            Ok(()) => {
                for cmd in &mut self.commands {
                    cmd.set_result(CommandResult::Ok, None);
                }
                Ok(())
            }
            Err(GitError::RefConflict { ref_name, message }) => {
                for cmd in &mut self.commands {
                    if cmd.ref_name == ref_name {
                        cmd.set_result(CommandResult::LockFailure, Some(message.clone()));
                    } else {
                        cmd.set_result(
                            CommandResult::RejectedOther,
                            Some("transaction aborted".to_owned()),
                        );
                    }
                }
                Err(UpdateError::LockFailure {
                    message: format!(
                        "Update aborted with one or more lock failures: {}",
                        self.describe()
                    ),
                    refs: vec![ref_name],
                })
            }
            Err(other) => {
                let msg = other.to_string();
                for cmd in &mut self.commands {
                    cmd.set_result(CommandResult::RejectedOther, Some(msg.clone()));
                }
                Err(UpdateError::Storage(other))
            }
        }
    }

    fn execute_each(&mut self, repo: &dyn GitRepo) -> Result<(), UpdateError> {
        let ref_log = self.ref_log();
        let mut lock_failures = Vec::new();
        let mut first_other = None;
        for cmd in &mut self.commands {
            if cmd.is_noop() {
                cmd.set_result(CommandResult::Ok, None);
                continue;
            }
            let edit = cmd.to_edit()?;
            match repo.atomic_ref_update(std::slice::from_ref(&edit), &ref_log) {
                Ok(()) => cmd.set_result(CommandResult::Ok, None),
                Err(GitError::RefConflict { message, .. }) => {
                    cmd.set_result(CommandResult::LockFailure, Some(message));
                    lock_failures.push(cmd.ref_name.clone());
                }
                Err(other) => {
                    cmd.set_result(CommandResult::RejectedOther, Some(other.to_string()));
                    first_other.get_or_insert(other);
                }
            }
        }
        if let Some(err) = first_other {
            return Err(UpdateError::Storage(err));
        }
        if lock_failures.is_empty() {
            return Ok(());
        }
        Err(UpdateError::LockFailure {
            message: format!("Update failed: {}", self.describe()),
            refs: lock_failures,
        })
    }

    fn describe(&self) -> String {
        self.commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Commands that count as "successfully updated": every command when
    /// `dryrun`, otherwise those with result OK.
    #[must_use]
    pub fn successfully_updated(&self, dryrun: bool) -> Vec<&ReceiveCommand> {
        self.commands
            .iter()
            .filter(|c| dryrun || c.result == CommandResult::Ok)
            .collect()
    }
}

/// Change refs and draft refs are grouped by change; every other ref is its
/// own group.
fn check_one_ref_per_change(commands: &[ReceiveCommand]) -> Result<(), UpdateError> {
    let mut per_change: BTreeMap<ChangeId, usize> = BTreeMap::new();
    for cmd in commands {
        if !cmd.ref_name.starts_with(REFS_CHANGES) {
            continue;
        }
        if let Some(id) = ChangeId::from_ref(&cmd.ref_name) {
            *per_change.entry(id).or_default() += 1;
        }
    }
    if per_change.values().any(|&n| n > 1) {
        return Err(UpdateError::usage(
            "non-atomic batch ref update only allows one ref per change",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbatch_git::{EntryMode, MemRepo, TreeEntry};

    fn commit(repo: &MemRepo, parents: &[GitOid], msg: &str) -> GitOid {
        let blob = repo.write_blob(msg.as_bytes()).unwrap();
        let tree = repo
            .write_tree(&[TreeEntry {
                name: "f".into(),
                mode: EntryMode::Blob,
                oid: blob,
            }])
            .unwrap();
        repo.create_commit(tree, parents, msg, None).unwrap()
    }

    fn refs(repo: &MemRepo) -> Vec<String> {
        repo.refs()
            .unwrap()
            .keys()
            .map(|r| r.as_str().to_owned())
            .collect()
    }

    #[test]
    fn atomic_batch_applies_everything() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        let mut batch = BatchRefUpdate::new();
        batch
            .add_command(ReceiveCommand::create("refs/heads/main", a))
            .add_command(ReceiveCommand::create("refs/changes/01/1/1", a));
        batch.execute(&repo).unwrap();
        assert!(batch.is_ok());
        assert_eq!(refs(&repo), vec!["refs/changes/01/1/1", "refs/heads/main"]);
    }

    #[test]
    fn atomic_lock_failure_marks_conflicting_ref() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        let b = commit(&repo, &[a], "b");
        repo.force_ref(&RefName::new("refs/heads/main").unwrap(), b).unwrap();

        let mut batch = BatchRefUpdate::new();
        batch
            .add_command(ReceiveCommand::create("refs/heads/other", a))
            .add_command(ReceiveCommand::create("refs/heads/main", a));
        let err = batch.execute(&repo).unwrap_err();
        assert!(err.is_retryable());
        assert!(err
            .to_string()
            .starts_with("Update aborted with one or more lock failures"));
        assert_eq!(batch.commands()[0].result(), CommandResult::RejectedOther);
        assert_eq!(batch.commands()[1].result(), CommandResult::LockFailure);
        assert_eq!(refs(&repo), vec!["refs/heads/main"]);
    }

    #[test]
    fn non_atomic_applies_independently() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        repo.force_ref(&RefName::new("refs/heads/taken").unwrap(), a).unwrap();

        let mut batch = BatchRefUpdate::new();
        batch
            .set_atomic(false)
            .add_command(ReceiveCommand::create("refs/heads/free", a))
            .add_command(ReceiveCommand::create("refs/heads/taken", a));
        let err = batch.execute(&repo).unwrap_err();
        assert!(err.to_string().starts_with("Update failed"));
        assert_eq!(batch.commands()[0].result(), CommandResult::Ok);
        assert_eq!(batch.commands()[1].result(), CommandResult::LockFailure);
        assert!(refs(&repo).contains(&"refs/heads/free".to_owned()));
    }

    #[test]
    fn non_atomic_refuses_two_refs_of_one_change() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        let mut batch = BatchRefUpdate::new();
        batch
            .set_atomic(false)
            .add_command(ReceiveCommand::create("refs/changes/01/1/1", a))
            .add_command(ReceiveCommand::create("refs/changes/01/1/meta", a))
            .add_command(ReceiveCommand::create("refs/heads/main", a));
        let err = batch.execute(&repo).unwrap_err();
        assert!(matches!(err, UpdateError::Usage(_)));
        assert!(batch.is_executed());
        assert!(batch
            .commands()
            .iter()
            .all(|c| c.result() == CommandResult::NotAttempted));
        assert!(refs(&repo).is_empty());
    }

    #[test]
    fn non_fast_forward_rejected_unless_allowed() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        let b = commit(&repo, &[], "b");
        let main = RefName::new("refs/heads/main").unwrap();
        repo.force_ref(&main, a).unwrap();

        let mut batch = BatchRefUpdate::new();
        batch.add_command(ReceiveCommand::new("refs/heads/main", a, b));
        let err = batch.execute(&repo).unwrap_err();
        assert!(matches!(err, UpdateError::RefUpdateRejected(_)));
        assert_eq!(batch.commands()[0].result(), CommandResult::RejectedNonFastForward);

        let mut forced = BatchRefUpdate::new();
        forced
            .set_allow_non_fast_forwards(true)
            .add_command(ReceiveCommand::new("refs/heads/main", a, b));
        forced.execute(&repo).unwrap();
        assert_eq!(repo.read_ref(&main).unwrap(), Some(b));
    }

    #[test]
    fn reflog_carries_message_and_ident() {
        let repo = MemRepo::new();
        let a = commit(&repo, &[], "a");
        let ident = PersonIdent::new("Alice", "alice@example.com");
        let mut batch = BatchRefUpdate::new();
        batch
            .set_ref_log_message(Some("submit".into()))
            .set_ref_log_ident(Some(ident.clone()))
            .add_command(ReceiveCommand::create("refs/heads/main", a));
        batch.execute(&repo).unwrap();
        let log = repo.reflog().unwrap();
        assert_eq!(log[0].message, "submit");
        assert_eq!(log[0].ident, Some(ident));
    }

    #[test]
    fn dryrun_counts_every_command() {
        let mut batch = BatchRefUpdate::new();
        batch.add_command(ReceiveCommand::create("refs/heads/main", GitOid::from_bytes([1; 20])));
        assert_eq!(batch.successfully_updated(true).len(), 1);
        assert!(batch.successfully_updated(false).is_empty());
    }
}
