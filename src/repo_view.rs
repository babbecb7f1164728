//! A view of one repository plus the ref commands staged against it.
//!
//! Reads through the view see staged commands as if they had already been
//! applied. Objects are written immediately but only flushed when the
//! owning update says so.

use std::collections::BTreeMap;
use std::sync::Arc;

use refbatch_git::{
    GitOid, GitRepo, PersonIdent, ProjectName, RefName, RepositoryStore, TreeEntry,
};

use crate::error::UpdateError;
use crate::ref_update::{BatchRefUpdate, ReceiveCommand};

/// One repository with staged, chained ref commands.
pub struct RepoView {
    project: ProjectName,
    repo: Arc<dyn GitRepo>,
    commands: Vec<ReceiveCommand>,
    opened_here: bool,
}

impl RepoView {
    /// Open `project` from `store`; the view owns the handle.
    ///
    /// # Errors
    /// `Storage` if the repository cannot be opened.
    pub fn open(store: &dyn RepositoryStore, project: &ProjectName) -> Result<Self, UpdateError> {
        let repo = store.open_repository(project)?;
        Ok(Self {
            project: project.clone(),
            repo,
            commands: Vec::new(),
            opened_here: true,
        })
    }

    /// Wrap a repository handle owned by the caller.
    #[must_use]
    pub fn with_repository(project: ProjectName, repo: Arc<dyn GitRepo>) -> Self {
        Self {
            project,
            repo,
            commands: Vec::new(),
            opened_here: false,
        }
    }

    /// A view over the same repository holding a copy of the staged
    /// commands. Commands staged on the fork do not affect `self`.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            project: self.project.clone(),
            repo: Arc::clone(&self.repo),
            commands: self.commands.clone(),
            opened_here: false,
        }
    }

    /// Like [`fork`](Self::fork), but reading through `repo`, a separately
    /// opened handle on the same project.
    #[must_use]
    pub fn snapshot_with(&self, repo: Arc<dyn GitRepo>) -> Self {
        Self {
            project: self.project.clone(),
            repo,
            commands: self.commands.clone(),
            opened_here: true,
        }
    }

    /// Project this view belongs to.
    #[must_use]
    pub const fn project(&self) -> &ProjectName {
        &self.project
    }

    /// The underlying repository.
    #[must_use]
    pub fn repository(&self) -> &dyn GitRepo {
        self.repo.as_ref()
    }

    /// Object writer whose `flush` is deferred to the owning update.
    #[must_use]
    pub fn inserter(&self) -> Inserter<'_> {
        Inserter {
            repo: self.repo.as_ref(),
        }
    }

    /// Current value of `name`, including staged commands.
    ///
    /// # Errors
    /// `BadRequest` for an invalid ref name, `Storage` on read failure.
    pub fn get_ref(&self, name: &str) -> Result<Option<GitOid>, UpdateError> {
        if let Some(cmd) = self.commands.iter().find(|c| c.ref_name() == name) {
            let new = cmd.new_id();
            return Ok((!new.is_zero()).then_some(new));
        }
        let ref_name = parse_ref(name)?;
        Ok(self.repo.read_ref(&ref_name)?)
    }

    /// All refs under `prefix` (full names), including staged commands.
    ///
    /// # Errors
    /// `Storage` if the ref database cannot be scanned.
    pub fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, GitOid>, UpdateError> {
        let mut refs: BTreeMap<String, GitOid> = self
            .repo
            .list_refs(prefix)?
            .into_iter()
            .map(|(name, oid)| (name.as_str().to_owned(), oid))
            .collect();
        for cmd in self.commands.iter().filter(|c| c.ref_name().starts_with(prefix)) {
            if cmd.new_id().is_zero() {
                refs.remove(cmd.ref_name());
            } else {
                refs.insert(cmd.ref_name().to_owned(), cmd.new_id());
            }
        }
        Ok(refs)
    }

    /// Stage a command. A second command on the same ref is chained onto
    /// the first: it must start where the first ends, and the two collapse
    /// into one command from the first's old value to the second's new one.
    ///
    /// # Errors
    /// `BadRequest` for an invalid ref name; `Usage` if the command does not
    /// chain onto the previous command for its ref.
    pub fn add_command(&mut self, cmd: ReceiveCommand) -> Result<(), UpdateError> {
        parse_ref(cmd.ref_name())?;
        match self.commands.iter_mut().find(|c| c.ref_name() == cmd.ref_name()) {
            Some(prev) if prev.new_id() != cmd.old_id() => Err(UpdateError::usage(format!(
                "cannot chain ref update {}: expected old value {}, previous command ends at {}",
                cmd.ref_name(),
                cmd.old_id(),
                prev.new_id()
            ))),
            Some(prev) => {
                prev.set_new_id(cmd.new_id());
                Ok(())
            }
            None => {
                self.commands.push(cmd);
                Ok(())
            }
        }
    }

    /// Staged commands in the order their refs were first touched.
    #[must_use]
    pub fn commands(&self) -> &[ReceiveCommand] {
        &self.commands
    }

    /// Number of staged commands that would move a ref.
    #[must_use]
    pub fn pending_ref_count(&self) -> usize {
        self.commands.iter().filter(|c| !c.is_noop()).count()
    }

    /// Move every staged command that would move a ref into `batch`,
    /// leaving the view empty.
    pub fn drain_into(&mut self, batch: &mut BatchRefUpdate) {
        for cmd in self.commands.drain(..).filter(|c| !c.is_noop()) {
            batch.add_command(cmd);
        }
    }

    /// Drop every staged command.
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Flush written objects to durable storage.
    ///
    /// # Errors
    /// `Storage` on flush failure.
    pub fn flush(&self) -> Result<(), UpdateError> {
        Ok(self.repo.flush_objects()?)
    }

    /// Release the view. The repository handle is dropped only if this view
    /// opened it.
    pub fn close(self) {
        tracing::trace!(
            project = %self.project,
            opened_here = self.opened_here,
            pending = self.commands.len(),
            "closing repo view"
        );
    }
}

impl std::fmt::Debug for RepoView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoView")
            .field("project", &self.project)
            .field("commands", &self.commands)
            .field("opened_here", &self.opened_here)
            .finish_non_exhaustive()
    }
}

fn parse_ref(name: &str) -> Result<RefName, UpdateError> {
    RefName::new(name).map_err(|e| UpdateError::BadRequest(e.to_string()))
}

/// Object writer handed to operations. `flush` does nothing; the owning
/// update flushes once after every operation ran.
pub struct Inserter<'a> {
    repo: &'a dyn GitRepo,
}

impl Inserter<'_> {
    /// Write a blob.
    ///
    /// # Errors
    /// `Storage` on write failure.
    pub fn insert_blob(&self, data: &[u8]) -> Result<GitOid, UpdateError> {
        Ok(self.repo.write_blob(data)?)
    }

    /// Write a tree.
    ///
    /// # Errors
    /// `Storage` on write failure.
    pub fn insert_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, UpdateError> {
        Ok(self.repo.write_tree(entries)?)
    }

    /// Write a commit.
    ///
    /// # Errors
    /// `Storage` on write failure.
    pub fn insert_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: Option<&PersonIdent>,
    ) -> Result<GitOid, UpdateError> {
        Ok(self.repo.create_commit(tree, parents, message, author)?)
    }

    /// No-op.
    pub const fn flush(&self) {}
}
