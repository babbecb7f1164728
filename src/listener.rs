//! Hooks observing the phase boundaries of a batch update.

use crate::error::UpdateError;

/// Called between phases of [`BatchUpdate::execute_all`]. Every hook fires
/// once per call, after the phase finished for every update in the call.
///
/// [`BatchUpdate::execute_all`]: crate::batch_update::BatchUpdate::execute_all
pub trait BatchUpdateListener: Send + Sync {
    /// Every `update_repo` ran and objects were flushed.
    ///
    /// # Errors
    /// Aborts the remaining phases.
    fn after_update_repos(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Repository ref commands were executed.
    ///
    /// # Errors
    /// Aborts the remaining phases.
    fn after_update_refs(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Change metadata was written.
    ///
    /// # Errors
    /// Aborts the remaining phases.
    fn after_update_changes(&self) -> Result<(), UpdateError> {
        Ok(())
    }
}
