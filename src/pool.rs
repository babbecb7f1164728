//! A fixed-size pool of named worker threads fed by a bounded queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, TrySendError, bounded};

use crate::error::UpdateError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on `threads` background threads.
///
/// Submitting never blocks: a job offered to a full queue is dropped.
/// Dropping the pool finishes every queued job, then joins the workers.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one) sharing a queue of
    /// `queue` jobs (at least one).
    ///
    /// # Errors
    /// `Other` if a thread cannot be spawned.
    pub fn new(name: &str, threads: usize, queue: usize) -> Result<Self, UpdateError> {
        let (tx, rx) = bounded::<Job>(queue.max(1));
        let mut workers = Vec::new();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let thread_name = format!("{name}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    for job in rx {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::warn!(thread = %thread_name, "background job panicked");
                        }
                    }
                })
                .map_err(|e| UpdateError::Other(anyhow::anyhow!("spawning {name} worker: {e}")))?;
            workers.push(handle);
        }
        Ok(Self {
            name: name.to_owned(),
            sender: Some(tx),
            workers,
        })
    }

    /// Queue `job` without waiting for room.
    ///
    /// # Errors
    /// `Other` if the queue is full (the job is dropped) or the pool is
    /// shutting down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), UpdateError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("{} pool is shut down", self.name)))?;
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(pool = %self.name, queued = sender.len(), "queue full, dropping job");
                Err(UpdateError::Other(anyhow::anyhow!("{} pool queue is full", self.name)))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(UpdateError::Other(anyhow::anyhow!("{} pool is shut down", self.name)))
            }
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test", 2, 4).unwrap();
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (started_tx, started_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(0);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test", 1, 1).unwrap();
            pool.submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
            started_rx.recv().unwrap();

            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            let c = Arc::clone(&counter);
            let err = pool
                .submit(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap_err();
            let UpdateError::Other(cause) = err else {
                panic!("expected a queue-full failure, got {err:?}");
            };
            assert!(cause.to_string().contains("queue is full"));

            release_tx.send(()).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test", 1, 2).unwrap();
            pool.submit(|| panic!("boom")).unwrap();
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
