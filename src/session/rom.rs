//! ROM session proxy.

use std::sync::Arc;

use super::context::ChildContext;
use super::session_info;
use super::tracked::TrackedValue;
use crate::kernel::RomService;
use crate::models::records::{RomRecord, SessionRecord};
use crate::models::session::SessionArgs;
use crate::models::{Badge, Kcap};
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts a child's access to one ROM module.
pub struct RomSession {
    real: Arc<dyn RomService>,
    info: TrackedValue<SessionRecord>,
    state: TrackedValue<RomRecord>,
}

impl RomSession {
    /// Wrap a real ROM session.
    #[must_use]
    pub fn new(real: Arc<dyn RomService>, context: &ChildContext, args: &SessionArgs) -> Self {
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

    /// Tracked ROM state.
    #[must_use]
    pub fn state(&self) -> &TrackedValue<RomRecord> {
        &self.state
    }

    /// Dataspace holding the module.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn dataspace(&self) -> Result<Badge> {
        let ds = self.real.dataspace()?;
        self.state.update(|r| r.dataspace = Some(ds));
        Ok(ds)
    }

    /// Refresh the module in place.
    pub fn update(&self) -> bool {
        self.real.update()
    }

    /// Register a module-changed handler.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn sigh(&self, sigh: Badge) -> Result<()> {
        self.real.sigh(sigh)?;
        self.state.update(|r| r.sigh = Some(sigh));
        Ok(())
    }
}

impl Checkpointable for RomSession {
    fn checkpoint(&self) -> Result<()> {
        self.state.checkpoint();
        self.info.checkpoint();
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.state.annotate(|r| {
            r.dataspace
                .map_or(Kcap::INVALID, |ds| kcaps.find_kcap_by_badge(ds))
        });
        self.info.annotate(|r| kcaps.find_kcap_by_badge(r.badge));
    }
}
