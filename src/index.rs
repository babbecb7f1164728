//! Reindexing of written changes.
//!
//! The engine only starts reindex work through [`Indexer`] and waits on the
//! returned [`IndexFuture`]s; the index itself lives elsewhere.

use crossbeam::channel::{Receiver, Sender, bounded};
use refbatch_git::ProjectName;

use crate::change::ChangeId;
use crate::error::UpdateError;

/// Starts reindex work for changes.
pub trait Indexer: Send + Sync {
    /// Reindex a written change.
    fn index_async(&self, project: &ProjectName, id: ChangeId) -> IndexFuture;

    /// Remove a deleted change from the index.
    fn delete_async(&self, project: &ProjectName, id: ChangeId) -> IndexFuture;
}

/// Indexes nothing; every future is already resolved.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopIndexer;

impl Indexer for NoopIndexer {
    fn index_async(&self, _project: &ProjectName, _id: ChangeId) -> IndexFuture {
        IndexFuture::ready()
    }

    fn delete_async(&self, _project: &ProjectName, _id: ChangeId) -> IndexFuture {
        IndexFuture::ready()
    }
}

#[derive(Debug)]
enum State {
    Done(Result<(), String>),
    Pending(Receiver<Result<(), String>>),
}

/// Completion of one reindex task.
#[derive(Debug)]
pub struct IndexFuture {
    state: State,
}

impl IndexFuture {
    /// An already successful future.
    #[must_use]
    pub const fn ready() -> Self {
        Self {
            state: State::Done(Ok(())),
        }
    }

    /// An already failed future.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: State::Done(Err(message.into())),
        }
    }

    /// A future resolved later through the returned completer.
    #[must_use]
    pub fn pending() -> (Self, IndexCompleter) {
        let (tx, rx) = bounded(1);
        (
            Self {
                state: State::Pending(rx),
            },
            IndexCompleter { tx },
        )
    }

    /// Block until the task finished.
    ///
    /// # Errors
    /// `Other` if the task failed or its completer was dropped unresolved.
    pub fn wait(self) -> Result<(), UpdateError> {
        let outcome = match self.state {
            State::Done(outcome) => outcome,
            State::Pending(rx) => rx
                .recv()
                .unwrap_or_else(|_| Err("index task dropped without completing".to_owned())),
        };
        outcome.map_err(|msg| UpdateError::Other(anyhow::anyhow!("reindex failed: {msg}")))
    }
}

/// Resolves a pending [`IndexFuture`].
#[derive(Debug)]
pub struct IndexCompleter {
    tx: Sender<Result<(), String>>,
}

impl IndexCompleter {
    /// Resolve the future. A waiter that already went away is ignored.
    pub fn complete(self, outcome: Result<(), String>) {
        let _ = self.tx.send(outcome);
    }
}
