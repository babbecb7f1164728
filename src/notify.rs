//! Ref-update events.

use refbatch_git::ProjectName;

use crate::change::Account;
use crate::ref_update::BatchRefUpdate;

/// Receives one event per executed ref batch.
pub trait ReferenceUpdateNotifier: Send + Sync {
    /// `batch` was executed in `project` on behalf of `actor` (`None` for
    /// the server).
    fn fire(&self, project: &ProjectName, batch: &BatchRefUpdate, actor: Option<&Account>);
}

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl ReferenceUpdateNotifier for NoopNotifier {
    fn fire(&self, _project: &ProjectName, _batch: &BatchRefUpdate, _actor: Option<&Account>) {}
}
