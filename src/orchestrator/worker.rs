//! Checkpoint worker: one background task per checkpointable unit.
//!
//! The worker accepts at most one job at a time. [`CheckpointWorker::start_checkpoint`]
//! waits for the "ready" permit, which a job holds until it has finished,
//! so a second start blocks until the previous job is fully consumed.
//! [`CheckpointWorker::join_checkpoint`] waits until every issued job has
//! completed and surfaces the failure of the latest one.
//!
//! Jobs run on the blocking pool because a unit's checkpoint step issues
//! synchronous kernel calls and copies memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cap_mapper::KcapTable;
use crate::{AppError, Result};

/// A unit whose state can be checkpointed by a worker.
pub trait Checkpointable: Send + Sync {
    /// Merge the unit's pending changes into its snapshot.
    ///
    /// Runs on the unit's worker only.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the current checkpoint pass.
    fn checkpoint(&self) -> Result<()>;

    /// Annotate stored records with kernel capability indices.
    fn annotate(&self, _kcaps: &KcapTable) {}
}

/// Progress of a worker's jobs.
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    /// Jobs finished so far.
    pub completed: u64,
    /// Duration of the last finished job.
    pub last_elapsed: Option<Duration>,
    /// Error of the last finished job.
    pub last_error: Option<AppError>,
}

struct WorkerInner {
    unit: String,
    jobs: mpsc::Sender<OwnedSemaphorePermit>,
    ready: Arc<Semaphore>,
    issued: AtomicU64,
    joined: AtomicU64,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
    affinity: Option<usize>,
}

/// Handle to the worker of one checkpointable unit.
#[derive(Clone)]
pub struct CheckpointWorker {
    inner: Arc<WorkerInner>,
}

impl CheckpointWorker {
    /// Spawn the worker task for `target`.
    ///
    /// Must be called from within a Tokio runtime. `affinity` is a CPU
    /// placement hint; it is recorded and logged but not enforced.
    #[must_use]
    pub fn spawn(
        unit: impl Into<String>,
        target: Arc<dyn Checkpointable>,
        affinity: Option<usize>,
        cancel: CancellationToken,
    ) -> Self {
        let unit = unit.into();
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(JobStatus::default());

        tokio::spawn(
            Self::run(target, jobs_rx, status_tx, cancel.clone())
                .instrument(info_span!("checkpoint_worker", unit = %unit)),
        );
        debug!(unit, ?affinity, "checkpoint worker started");

        Self {
            inner: Arc::new(WorkerInner {
                unit,
                jobs: jobs_tx,
                ready: Arc::new(Semaphore::new(1)),
                issued: AtomicU64::new(0),
                joined: AtomicU64::new(0),
                status: status_rx,
                cancel,
                affinity,
            }),
        }
    }

    async fn run(
        target: Arc<dyn Checkpointable>,
        mut jobs: mpsc::Receiver<OwnedSemaphorePermit>,
        status: watch::Sender<JobStatus>,
        cancel: CancellationToken,
    ) {
        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("checkpoint worker stopped");
                    return;
                }
                job = jobs.recv() => match job {
                    Some(permit) => permit,
                    None => return,
                },
            };

            let started = Instant::now();
            let unit = Arc::clone(&target);
            let result = match tokio::task::spawn_blocking(move || unit.checkpoint()).await {
                Ok(result) => result,
                Err(err) => Err(AppError::Worker(format!("checkpoint job aborted: {err}"))),
            };
            let elapsed = started.elapsed();
            let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);

            match &result {
                Ok(()) => debug!(elapsed_us, "checkpoint job finished"),
                Err(err) => warn!(elapsed_us, %err, "checkpoint job failed"),
            }
            status.send_modify(|s| {
                s.completed += 1;
                s.last_elapsed = Some(elapsed);
                s.last_error = result.err();
            });
            drop(permit);
        }
    }

    /// Unit name.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.inner.unit
    }

    /// CPU placement hint.
    #[must_use]
    pub fn affinity(&self) -> Option<usize> {
        self.inner.affinity
    }

    /// Enqueue one checkpoint job, waiting until the previous job finished.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Worker` if the worker has been stopped.
    pub async fn start_checkpoint(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(self.stopped());
        }
        let permit = tokio::select! {
            () = self.inner.cancel.cancelled() => return Err(self.stopped()),
            permit = Arc::clone(&self.inner.ready).acquire_owned() => {
                permit.map_err(|_| self.stopped())?
            }
        };
        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        if self.inner.jobs.send(permit).await.is_err() {
            self.inner.issued.fetch_sub(1, Ordering::SeqCst);
            return Err(self.stopped());
        }
        Ok(())
    }

    /// Wait until every enqueued job has finished.
    ///
    /// Returns immediately if nothing was enqueued since the last join.
    ///
    /// # Errors
    ///
    /// Returns the error of the latest job if it failed, or
    /// `AppError::Worker` if the worker stopped first.
    pub async fn join_checkpoint(&self) -> Result<()> {
        let target = self.inner.issued.load(Ordering::SeqCst);
        let mut status = self.inner.status.clone();
        let finished = tokio::select! {
            () = self.inner.cancel.cancelled() => return Err(self.stopped()),
            finished = status.wait_for(|s| s.completed >= target) => {
                finished.map(|s| s.clone()).map_err(|_| self.stopped())?
            }
        };
        let previous = self.inner.joined.swap(target, Ordering::SeqCst);
        if target > previous {
            if let Some(err) = finished.last_error {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Current job progress.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.inner.status.borrow().clone()
    }

    /// Unblock the worker so its task exits.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(unit = %self.inner.unit, "stopping checkpoint worker");
        }
        self.inner.cancel.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn stopped(&self) -> AppError {
        AppError::Worker(format!("worker '{}' stopped", self.inner.unit))
    }
}
