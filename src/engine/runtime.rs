//! Bounded job runtime for whole-organization runs.
//!
//! Organizations may hold hundreds of thousands of records, so whole
//! organization runs execute on a small pool of named worker threads fed by a
//! bounded queue. Callers get a [`JobHandle`] right away and poll the progress
//! key, cancel, or join.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{MatchEngine, ProgressData, ProgressTracker, RunLock, WholeOrgOutcome};
use crate::error::{ExecutionError, MatchError, MatchResult};
use crate::ids::OrganizationId;
use crate::inventory::InventoryKind;
use crate::matching::MatchCriteria;

enum Job {
    WholeOrg {
        organization: OrganizationId,
        kind: InventoryKind,
        criteria: MatchCriteria,
        preview: bool,
        cancel: Arc<AtomicBool>,
        tracker: ProgressTracker,
        // Held until the job finishes.
        lock: RunLock,
        reply: Sender<MatchResult<WholeOrgOutcome>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, engine: Arc<MatchEngine>) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(&engine);
            let handle = thread::Builder::new()
                .name(format!("matchlink-job-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(job) => run_job(&engine, job),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn matchlink worker");
            handles.push(handle);
        }

        Self {
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    fn try_submit(&self, job: Job) -> Result<(), MatchError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected.into()),
        }
    }

    fn shutdown(self) {
        // Close the channel: workers drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn run_job(engine: &MatchEngine, job: Job) {
    match job {
        Job::WholeOrg {
            organization,
            kind,
            criteria,
            preview,
            cancel,
            mut tracker,
            lock,
            reply,
        } => {
            let run = catch_unwind(AssertUnwindSafe(|| {
                engine.execute_whole_org(organization, kind, &criteria, preview, &cancel, Some(&mut tracker))
            }));
            let result = run.unwrap_or_else(|_| {
                error!(organization = %organization, kind = %kind, "whole-organization job panicked");
                if let Err(e) = tracker.abort("Job panicked") {
                    error!(error = %e, "failed to record job failure");
                }
                Err(MatchError::internal("whole-organization job panicked"))
            });
            drop(lock);
            let _ = reply.send(result);
        }

        #[cfg(test)]
        Job::Sleep { duration, reply } => {
            thread::sleep(duration);
            let _ = reply.send(());
        }
    }
}

/// Handle returned by [`JobRuntime::submit_whole_org`].
pub struct JobHandle {
    id: Uuid,
    progress_key: String,
    cancel: Arc<AtomicBool>,
    rx: Receiver<MatchResult<WholeOrgOutcome>>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("progress_key", &self.progress_key)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    /// Job id, also the last segment of the progress key.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Key to poll with [`MatchEngine::progress`].
    #[must_use]
    pub fn progress_key(&self) -> &str {
        &self.progress_key
    }

    /// Asks the job to stop before its next cycle. Finished cycles stay committed.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits for the job to complete.
    pub fn join(self) -> MatchResult<WholeOrgOutcome> {
        self.rx.recv().map_err(|_| MatchError::from(ExecutionError::Disconnected))?
    }

    /// Waits for the job to complete with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> MatchResult<WholeOrgOutcome> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => MatchError::from(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => MatchError::from(ExecutionError::Disconnected),
        })?
    }
}

/// Runs whole-organization jobs on a bounded pool.
pub struct JobRuntime {
    engine: Arc<MatchEngine>,
    pool: WorkerPool,
}

impl JobRuntime {
    /// Starts the pool sized by the engine's configuration.
    #[must_use]
    pub fn new(engine: MatchEngine) -> Self {
        let engine = Arc::new(engine);
        let config = engine.config().clone();
        let pool = WorkerPool::start(config.job_workers, config.queue_capacity, Arc::clone(&engine));
        Self { engine, pool }
    }

    /// Queues a whole-organization run.
    ///
    /// Criteria are validated and the run lock taken before anything is queued,
    /// so configuration errors and `Locked` are returned here, synchronously.
    /// With `proposed` the job is a preview and commits nothing.
    pub fn submit_whole_org(
        &self,
        organization: OrganizationId,
        kind: InventoryKind,
        proposed: Option<Vec<String>>,
    ) -> MatchResult<JobHandle> {
        let criteria = self
            .engine
            .resolve_criteria(organization, kind, proposed.as_deref())?;
        let lock = RunLock::acquire(
            Arc::clone(self.engine.kv()),
            organization,
            kind,
            self.engine.config().lock_ttl(),
        )?;

        let id = Uuid::new_v4();
        let tracker = self.engine.tracker(id)?;
        let progress_key = tracker.key().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let (reply, rx) = bounded::<MatchResult<WholeOrgOutcome>>(1);

        self.pool.try_submit(Job::WholeOrg {
            organization,
            kind,
            criteria,
            preview: proposed.is_some(),
            cancel: Arc::clone(&cancel),
            tracker,
            lock,
            reply,
        })?;
        info!(job = %id, organization = %organization, kind = %kind, "queued whole-organization job");

        Ok(JobHandle {
            id,
            progress_key,
            cancel,
            rx,
        })
    }

    /// Reads a progress record.
    pub fn progress(&self, key: &str) -> MatchResult<Option<ProgressData>> {
        self.engine.progress(key)
    }

    /// Returns a shared reference to the underlying engine.
    #[must_use]
    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> Result<Receiver<()>, MatchError> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for JobRuntime {
    fn drop(&mut self) {
        // Deterministic shutdown: stop workers and join threads.
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
    }
}
