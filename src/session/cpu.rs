//! CPU session proxy.
//!
//! Tracks the child's threads. The session-level [`pause`](CpuSession::pause)
//! and [`resume`](CpuSession::resume) stop and continue the real threads
//! for checkpointing without touching the recorded paused flags, which
//! describe what the child itself requested. Threads the child paused
//! itself are left alone, and only threads suspended by the session-level
//! pause are continued again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::context::ChildContext;
use super::cpu_thread::CpuThread;
use super::tracked::{TrackedObjects, TrackedValue};
use super::{lock, session_info};
use crate::kernel::{Address, Affinity, CpuService};
use crate::models::records::{SessionRecord, ThreadRecord};
use crate::models::session::SessionArgs;
use crate::models::Badge;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts thread management of one child.
pub struct CpuSession {
    real: Arc<dyn CpuService>,
    context: Arc<ChildContext>,
    info: TrackedValue<SessionRecord>,
    threads: Arc<TrackedObjects<Badge, ThreadRecord>>,
    handles: Mutex<BTreeMap<Badge, Arc<CpuThread>>>,
    suspended: Mutex<BTreeSet<Badge>>,
}

impl CpuSession {
    /// Wrap a real CPU session.
    #[must_use]
    pub fn new(real: Arc<dyn CpuService>, context: Arc<ChildContext>, args: &SessionArgs) -> Self {
        Self {
            info: session_info(real.badge(), args, &context),
            real,
            context,
            threads: Arc::new(TrackedObjects::new("thread")),
            handles: Mutex::new(BTreeMap::new()),
            suspended: Mutex::new(BTreeSet::new()),
        }
    }

    /// Badge of the real session.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.real.badge()
    }

    /// Session bookkeeping.
    #[must_use]
    pub fn info(&self) -> &TrackedValue<SessionRecord> {
        &self.info
    }

    /// Thread records.
    #[must_use]
    pub fn threads(&self) -> &TrackedObjects<Badge, ThreadRecord> {
        &self.threads
    }

    /// Proxy of a live thread.
    #[must_use]
    pub fn thread(&self, badge: Badge) -> Option<Arc<CpuThread>> {
        lock(&self.handles).get(&badge).cloned()
    }

    fn handles(&self) -> Vec<Arc<CpuThread>> {
        lock(&self.handles).values().cloned().collect()
    }

    /// Create a thread in the PD identified by `pd`.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn create_thread(
        &self,
        pd: Badge,
        name: &str,
        affinity: Affinity,
        weight: u32,
        utcb: Address,
    ) -> Result<Arc<CpuThread>> {
        let real = self.real.create_thread(pd, name, affinity, weight, utcb)?;
        let badge = real.badge();
        self.threads.insert(
            badge,
            ThreadRecord {
                badge,
                bootstrapped: self.context.bootstrapping(),
                name: name.to_owned(),
                pd,
                weight,
                utcb,
                started: false,
                paused: false,
                single_step: false,
                affinity,
                exception_sigh: None,
                registers: None,
            },
        );
        let thread = Arc::new(CpuThread::new(real, Arc::clone(&self.threads)));
        lock(&self.handles).insert(badge, Arc::clone(&thread));
        debug!(child = self.context.name(), %badge, name, "thread created");
        Ok(thread)
    }

    /// Destroy a thread; forwarded even if unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn kill_thread(&self, thread: Badge) -> Result<()> {
        lock(&self.handles).remove(&thread);
        lock(&self.suspended).remove(&thread);
        if self.threads.remove(thread).is_none() {
            warn!(child = self.context.name(), %thread, "kill of unrecorded thread forwarded");
        }
        self.real.kill_thread(thread)
    }

    /// Register the default exception handler.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn exception_sigh(&self, sigh: Badge) -> Result<()> {
        self.real.exception_sigh(sigh)
    }

    /// Suspend every real thread without recording it as a child pause.
    ///
    /// Threads whose record says the child paused them are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first error; every thread is attempted regardless.
    pub fn pause(&self) -> Result<()> {
        let running: Vec<Arc<CpuThread>> = self
            .handles()
            .into_iter()
            .filter(|thread| !self.threads.get(thread.badge()).is_some_and(|r| r.paused))
            .collect();
        let mut suspended = lock(&self.suspended);
        self.for_each_thread("pause", running, |thread| {
            thread.real().pause()?;
            suspended.insert(thread.badge());
            Ok(())
        })
    }

    /// Continue the threads suspended by [`pause`](Self::pause) without
    /// recording it as a child resume.
    ///
    /// # Errors
    ///
    /// Returns the first error; every thread is attempted regardless.
    pub fn resume(&self) -> Result<()> {
        let suspended = std::mem::take(&mut *lock(&self.suspended));
        let threads: Vec<Arc<CpuThread>> = {
            let handles = lock(&self.handles);
            suspended
                .iter()
                .filter_map(|badge| handles.get(badge).cloned())
                .collect()
        };
        self.for_each_thread("resume", threads, |thread| thread.real().resume())
    }

    /// Threads currently held by the session-level pause.
    #[must_use]
    pub fn suspended(&self) -> Vec<Badge> {
        lock(&self.suspended).iter().copied().collect()
    }

    fn for_each_thread(
        &self,
        op: &str,
        threads: Vec<Arc<CpuThread>>,
        mut f: impl FnMut(&CpuThread) -> Result<()>,
    ) -> Result<()> {
        let mut first_err = None;
        for thread in threads {
            if let Err(err) = f(&thread) {
                warn!(child = self.context.name(), thread = %thread.badge(), op, %err, "thread operation failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Kill every live thread.
    ///
    /// # Errors
    ///
    /// Returns the first error; every thread is attempted regardless.
    pub fn close(&self) -> Result<()> {
        let threads: Vec<Badge> = lock(&self.handles).keys().copied().collect();
        let mut first_err = None;
        for thread in threads {
            if let Err(err) = self.kill_thread(thread) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Checkpointable for CpuSession {
    fn checkpoint(&self) -> Result<()> {
        let mut merge = self.threads.begin_merge();
        for (badge, stored) in merge.records_mut() {
            let Some(thread) = self.thread(*badge) else {
                continue;
            };
            match thread.state() {
                Ok(state) => stored.record.registers = Some(state),
                Err(err) => {
                    debug!(child = self.context.name(), thread = %badge, %err, "register state unavailable");
                }
            }
        }
        let summary = merge.commit();
        self.info.checkpoint();
        info!(child = self.context.name(), ?summary, "cpu session checkpointed");
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.threads
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        self.info.annotate(|record| kcaps.find_kcap_by_badge(record.badge));
    }
}
