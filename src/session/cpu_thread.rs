//! CPU-thread proxy.

use std::sync::Arc;

use super::tracked::TrackedObjects;
use crate::kernel::{Address, Affinity, CpuThreadService, ThreadState};
use crate::models::records::ThreadRecord;
use crate::models::Badge;
use crate::Result;

/// Intercepts the calls a child makes on one of its threads.
///
/// Every state-affecting call updates the thread's record in the owning
/// CPU session's table after the real call succeeded.
pub struct CpuThread {
    real: Arc<dyn CpuThreadService>,
    records: Arc<TrackedObjects<Badge, ThreadRecord>>,
}

impl CpuThread {
    pub(crate) fn new(
        real: Arc<dyn CpuThreadService>,
        records: Arc<TrackedObjects<Badge, ThreadRecord>>,
    ) -> Self {
        Self { real, records }
    }

    /// Thread badge.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.real.badge()
    }

    pub(crate) fn real(&self) -> &Arc<dyn CpuThreadService> {
        &self.real
    }

    fn record(&self, f: impl FnOnce(&mut ThreadRecord)) {
        self.records.update(self.badge(), f);
    }

    /// Start the thread.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn start(&self, ip: Address, sp: Address) -> Result<()> {
        self.real.start(ip, sp)?;
        self.record(|r| r.started = true);
        Ok(())
    }

    /// Pause the thread on behalf of the child.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn pause(&self) -> Result<()> {
        self.real.pause()?;
        self.record(|r| r.paused = true);
        Ok(())
    }

    /// Resume the thread on behalf of the child.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn resume(&self) -> Result<()> {
        self.real.resume()?;
        self.record(|r| r.paused = false);
        Ok(())
    }

    /// Read the register state.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn state(&self) -> Result<ThreadState> {
        self.real.state()
    }

    /// Overwrite the register state.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn set_state(&self, state: ThreadState) -> Result<()> {
        self.real.set_state(state)
    }

    /// Enable or disable single stepping.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn single_step(&self, enabled: bool) -> Result<()> {
        self.real.single_step(enabled)?;
        self.record(|r| r.single_step = enabled);
        Ok(())
    }

    /// Move the thread to another CPU.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn affinity(&self, location: Affinity) -> Result<()> {
        self.real.affinity(location)?;
        self.record(|r| r.affinity = location);
        Ok(())
    }

    /// Register an exception handler.
    ///
    /// # Errors
    ///
    /// Returns the real thread's error unchanged.
    pub fn exception_sigh(&self, sigh: Badge) -> Result<()> {
        self.real.exception_sigh(sigh)?;
        self.record(|r| r.exception_sigh = Some(sigh));
        Ok(())
    }
}
