//! Executing many [`BatchUpdate`]s as one submission.

use refbatch_git::ProjectName;

use crate::batch_update::BatchUpdate;
use crate::error::UpdateError;
use crate::listener::BatchUpdateListener;

/// Hooks around a submission, for follow-up work such as updating
/// superprojects.
pub trait SubmissionListener: Send {
    /// Called once before the first execution.
    fn set_dry_run(&mut self, _dryrun: bool) {}

    /// Called before each group of updates is executed.
    ///
    /// # Errors
    /// A failure aborts the submission before anything is written.
    fn before_update_refs(&mut self, _updates: &[BatchUpdate]) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Called once every group was executed, with every ref the
    /// submission moved.
    fn after_submission(&mut self, _updated: &[(ProjectName, String)]) {}
}

/// Runs groups of updates and remembers which refs they moved.
pub struct SubmissionExecutor {
    dryrun: bool,
    listeners: Vec<Box<dyn SubmissionListener>>,
    updated: Vec<(ProjectName, String)>,
    executions: usize,
}

impl std::fmt::Debug for SubmissionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionExecutor")
            .field("dryrun", &self.dryrun)
            .field("listeners", &self.listeners.len())
            .field("updated", &self.updated)
            .field("executions", &self.executions)
            .finish()
    }
}

impl SubmissionExecutor {
    /// An executor notifying `listeners`.
    #[must_use]
    pub fn new(dryrun: bool, mut listeners: Vec<Box<dyn SubmissionListener>>) -> Self {
        for listener in &mut listeners {
            listener.set_dry_run(dryrun);
        }
        Self {
            dryrun,
            listeners,
            updated: Vec::new(),
            executions: 0,
        }
    }

    /// `true` if nothing is written.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dryrun
    }

    /// Execute `updates` together, with `batch_listeners` called between
    /// phases.
    ///
    /// # Errors
    /// The first listener or execution failure. Nothing from a failed
    /// group is recorded as updated.
    #[tracing::instrument(skip_all, fields(updates = updates.len(), dryrun = self.dryrun))]
    pub fn execute(
        &mut self,
        updates: &mut [BatchUpdate],
        batch_listeners: &[&dyn BatchUpdateListener],
    ) -> Result<(), UpdateError> {
        for listener in &mut self.listeners {
            listener.before_update_refs(updates)?;
        }
        BatchUpdate::execute_all(updates, batch_listeners, self.dryrun)?;
        self.executions += 1;
        for update in updates.iter() {
            let project = update.project();
            self.updated.extend(
                update
                    .successfully_updated_branches(self.dryrun)
                    .into_iter()
                    .map(|r| (project.clone(), r)),
            );
        }
        tracing::debug!(refs = self.updated.len(), "submission group executed");
        Ok(())
    }

    /// Every ref moved so far, in execution order.
    #[must_use]
    pub fn updated_branches(&self) -> &[(ProjectName, String)] {
        &self.updated
    }

    /// Tell every listener the submission finished.
    pub fn after_executions(&mut self) {
        if self.executions == 0 {
            return;
        }
        for listener in &mut self.listeners {
            listener.after_submission(&self.updated);
        }
    }
}
