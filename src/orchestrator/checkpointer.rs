//! Checkpoint orchestrator: pause, checkpoint, resume.
//!
//! State machine per cycle: `Idle -> Paused -> Checkpointing -> Paused ->
//! Idle`. The state lock is held for the whole of each operation, so
//! operations from different callers (periodic timer, IPC) serialize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::{ChildInfo, ChildRegistry};
use super::worker::CheckpointWorker;
use crate::models::report::{CheckpointMode, CheckpointReport, ChildReport, UnitTiming};
use crate::session::lock;
use crate::{AppError, Result};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointerState {
    /// Children run normally.
    Idle,
    /// Every child thread is suspended.
    Paused,
    /// A checkpoint pass is running.
    Checkpointing,
}

/// Drives pause/checkpoint/resume across every registered child.
pub struct Checkpointer {
    registry: Arc<ChildRegistry>,
    mode: CheckpointMode,
    state: tokio::sync::Mutex<CheckpointerState>,
    epoch: AtomicU64,
    last_report: Mutex<Option<CheckpointReport>>,
}

impl Checkpointer {
    /// Create an idle orchestrator.
    #[must_use]
    pub fn new(registry: Arc<ChildRegistry>, mode: CheckpointMode) -> Self {
        Self {
            registry,
            mode,
            state: tokio::sync::Mutex::new(CheckpointerState::Idle),
            epoch: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Scheduling mode.
    #[must_use]
    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    /// Current state; waits for a running operation to finish.
    pub async fn state(&self) -> CheckpointerState {
        *self.state.lock().await
    }

    /// Epoch of the last checkpoint pass.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Report of the last successful pass.
    #[must_use]
    pub fn last_report(&self) -> Option<CheckpointReport> {
        lock(&self.last_report).clone()
    }

    /// Suspend every thread of every child. No-op when already paused.
    ///
    /// # Errors
    ///
    /// Returns the first thread that could not be suspended; the state
    /// still moves to `Paused` so a following `resume` reaches every thread.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == CheckpointerState::Paused {
            return Ok(());
        }
        let mut first_err = None;
        for child in self.registry.children() {
            if let Some(cpu) = child.cpu() {
                if let Err(err) = cpu.pause() {
                    first_err.get_or_insert(err);
                }
            }
        }
        *state = CheckpointerState::Paused;
        info!("children paused");
        first_err.map_or(Ok(()), Err)
    }

    /// Continue every thread of every child. No-op when idle.
    ///
    /// # Errors
    ///
    /// Returns the first thread that could not be continued.
    pub async fn resume(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == CheckpointerState::Idle {
            return Ok(());
        }
        let mut first_err = None;
        for child in self.registry.children() {
            if let Some(cpu) = child.cpu() {
                if let Err(err) = cpu.resume() {
                    first_err.get_or_insert(err);
                }
            }
        }
        *state = CheckpointerState::Idle;
        info!("children resumed");
        first_err.map_or(Ok(()), Err)
    }

    /// Run one checkpoint pass over every child.
    ///
    /// Requires paused children and leaves them paused.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the children are not paused, or
    /// the first error of any unit's checkpoint job. Units that failed keep
    /// their previous snapshot.
    ///
    /// After a successful pass, translations no snapshot refers to any more
    /// are released.
    pub async fn checkpoint(&self) -> Result<CheckpointReport> {
        let mut state = self.state.lock().await;
        if *state != CheckpointerState::Paused {
            return Err(AppError::InvalidState(
                "checkpoint requires paused children".into(),
            ));
        }
        *state = CheckpointerState::Checkpointing;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        let started = Instant::now();
        let children = self.registry.children();
        for child in &children {
            child.context().translations().begin_epoch(epoch);
        }

        let span = info_span!("checkpoint", epoch, mode = ?self.mode);
        let timings = match self.mode {
            CheckpointMode::Sequential => run_sequential(&children).instrument(span).await,
            CheckpointMode::Parallel => run_parallel(&children).instrument(span).await,
        };
        *state = CheckpointerState::Paused;
        let timings = timings?;

        let mut reports = Vec::with_capacity(children.len());
        for (child, units) in children.iter().zip(timings) {
            let released = child.context().translations().release_stale();
            if released > 0 {
                debug!(child = child.name(), released, "unreferenced translations released");
            }
            let kcaps = child.kcap_table();
            child.annotate(&kcaps);
            let (copied_dataspaces, copied_bytes) =
                child.context().translations().copied_in_epoch(epoch);
            reports.push(ChildReport {
                child: child.name().to_owned(),
                units,
                copied_dataspaces,
                copied_bytes,
                kcap_entries: kcaps.len(),
            });
        }

        let report = CheckpointReport {
            epoch,
            mode: self.mode,
            started_at,
            total_us: elapsed_us(started),
            children: reports,
        };
        info!(epoch, total_us = report.total_us, children = report.children.len(), "checkpoint complete");
        *lock(&self.last_report) = Some(report.clone());
        Ok(report)
    }

    /// Pause, checkpoint and resume.
    ///
    /// Children are resumed even if the checkpoint fails.
    ///
    /// # Errors
    ///
    /// Returns the pause, checkpoint or resume error, in that priority.
    pub async fn run_cycle(&self) -> Result<CheckpointReport> {
        if let Err(err) = self.pause().await {
            warn!(%err, "pause incomplete, resuming");
            self.resume().await?;
            return Err(err);
        }
        let report = self.checkpoint().await;
        let resumed = self.resume().await;
        let report = report?;
        resumed?;
        Ok(report)
    }
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn timing(worker: &CheckpointWorker) -> UnitTiming {
    let elapsed = worker.status().last_elapsed.unwrap_or_default();
    UnitTiming {
        unit: worker.unit().to_owned(),
        elapsed_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
    }
}

/// Start and join one unit at a time, child by child.
async fn run_sequential(children: &[Arc<ChildInfo>]) -> Result<Vec<Vec<UnitTiming>>> {
    let mut all = Vec::with_capacity(children.len());
    for child in children {
        let mut units = Vec::new();
        for worker in child.workers() {
            worker.start_checkpoint().await?;
            worker.join_checkpoint().await?;
            debug!(child = child.name(), unit = worker.unit(), "unit checkpointed");
            units.push(timing(&worker));
        }
        all.push(units);
    }
    Ok(all)
}

/// Start every unit of every child, then join them all.
async fn run_parallel(children: &[Arc<ChildInfo>]) -> Result<Vec<Vec<UnitTiming>>> {
    let workers: Vec<Vec<CheckpointWorker>> = children.iter().map(|c| c.workers()).collect();
    let mut first_err = None;

    let mut started = Vec::with_capacity(workers.len());
    for child_workers in &workers {
        let mut child_started = Vec::with_capacity(child_workers.len());
        for worker in child_workers {
            match worker.start_checkpoint().await {
                Ok(()) => child_started.push(worker),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        started.push(child_started);
    }

    let mut all = Vec::with_capacity(started.len());
    for (child, child_started) in children.iter().zip(started) {
        let mut units = Vec::with_capacity(child_started.len());
        for worker in child_started {
            if let Err(err) = worker.join_checkpoint().await {
                warn!(child = child.name(), unit = worker.unit(), %err, "unit checkpoint failed");
                first_err.get_or_insert(err);
            }
            units.push(timing(worker));
        }
        all.push(units);
    }

    first_err.map_or(Ok(all), Err)
}
