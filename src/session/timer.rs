//! Timer session proxy.

use std::sync::Arc;

use super::context::ChildContext;
use super::session_info;
use super::tracked::TrackedValue;
use crate::kernel::TimerService;
use crate::models::records::{SessionRecord, TimerRecord};
use crate::models::session::SessionArgs;
use crate::models::{Badge, Kcap};
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts a child's timeouts.
pub struct TimerSession {
    real: Arc<dyn TimerService>,
    info: TrackedValue<SessionRecord>,
    state: TrackedValue<TimerRecord>,
}

impl TimerSession {
    /// Wrap a real timer session.
    #[must_use]
    pub fn new(real: Arc<dyn TimerService>, context: &ChildContext, args: &SessionArgs) -> Self {
        Self {
            info: session_info(real.badge(), args, context),
            real,
            state: TrackedValue::default(),
        }
    }

    /// Session bookkeeping.
    #[must_use]
    pub fn info(&self) -> &TrackedValue<SessionRecord> {
        &self.info
    }

    /// Tracked timeout state.
    #[must_use]
    pub fn state(&self) -> &TrackedValue<TimerRecord> {
        &self.state
    }

    /// Request one timeout.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn trigger_once(&self, us: u64) -> Result<()> {
        self.real.trigger_once(us)?;
        self.state.update(|r| {
            r.timeout_us = us;
            r.periodic = false;
        });
        Ok(())
    }

    /// Request periodic timeouts.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn trigger_periodic(&self, us: u64) -> Result<()> {
        self.real.trigger_periodic(us)?;
        self.state.update(|r| {
            r.timeout_us = us;
            r.periodic = true;
        });
        Ok(())
    }

    /// Register the timeout handler.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn sigh(&self, sigh: Badge) -> Result<()> {
        self.real.sigh(sigh)?;
        self.state.update(|r| r.sigh = Some(sigh));
        Ok(())
    }

    /// Milliseconds since the session was opened.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.real.elapsed_ms()
    }
}

impl Checkpointable for TimerSession {
    fn checkpoint(&self) -> Result<()> {
        self.state.checkpoint();
        self.info.checkpoint();
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.state
            .annotate(|r| r.sigh.map_or(Kcap::INVALID, |s| kcaps.find_kcap_by_badge(s)));
        self.info.annotate(|r| kcaps.find_kcap_by_badge(r.badge));
    }
}
