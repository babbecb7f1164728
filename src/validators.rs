//! Validation of queued ref commands before anything is written.

use std::sync::Arc;

use refbatch_git::ProjectName;

use crate::error::UpdateError;
use crate::ref_update::ReceiveCommand;
use crate::repo_view::RepoView;

/// Checks the commands a submit is about to execute.
pub trait OnSubmitValidator: Send + Sync {
    /// Inspect `commands` against `view`.
    ///
    /// # Errors
    /// A message explaining why the submit must not proceed.
    fn validate(
        &self,
        project: &ProjectName,
        view: &RepoView,
        commands: &[ReceiveCommand],
    ) -> Result<(), String>;
}

/// An ordered set of validators; the first rejection wins.
#[derive(Clone, Default)]
pub struct OnSubmitValidators {
    validators: Vec<Arc<dyn OnSubmitValidator>>,
}

impl OnSubmitValidators {
    /// Run `validators` in order.
    #[must_use]
    pub fn new(validators: Vec<Arc<dyn OnSubmitValidator>>) -> Self {
        Self { validators }
    }

    /// `true` if there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator against the commands staged in `view`.
    ///
    /// # Errors
    /// `Validation` with the first rejection's message.
    pub fn validate(&self, view: &RepoView) -> Result<(), UpdateError> {
        let commands = view.commands();
        for validator in &self.validators {
            validator
                .validate(view.project(), view, commands)
                .map_err(UpdateError::Validation)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for OnSubmitValidators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnSubmitValidators")
            .field("len", &self.validators.len())
            .finish()
    }
}
