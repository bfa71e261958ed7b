//! RAM session proxy.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::ChildContext;
use super::session_info;
use super::tracked::{TrackedObjects, TrackedValue};
use crate::kernel::{CacheAttr, RamService};
use crate::models::records::{RamDataspaceRecord, SessionRecord};
use crate::models::session::SessionArgs;
use crate::models::Badge;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts dataspace allocation of one child.
pub struct RamSession {
    real: Arc<dyn RamService>,
    context: Arc<ChildContext>,
    info: TrackedValue<SessionRecord>,
    dataspaces: TrackedObjects<Badge, RamDataspaceRecord>,
}

impl RamSession {
    /// Wrap a real RAM session.
    #[must_use]
    pub fn new(real: Arc<dyn RamService>, context: Arc<ChildContext>, args: &SessionArgs) -> Self {
        Self {
            info: session_info(real.badge(), args, &context),
            real,
            context,
            dataspaces: TrackedObjects::new("ram dataspace"),
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

    /// Allocated dataspaces.
    #[must_use]
    pub fn dataspaces(&self) -> &TrackedObjects<Badge, RamDataspaceRecord> {
        &self.dataspaces
    }

    /// Allocate a dataspace.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn alloc(&self, size: usize, cache: CacheAttr) -> Result<Badge> {
        let ds = self.real.alloc(size, cache)?;
        self.dataspaces.insert(
            ds,
            RamDataspaceRecord {
                badge: ds,
                bootstrapped: self.context.bootstrapping(),
                size,
                cache,
                is_region_map: self.context.is_region_map_dataspace(ds),
                backing: None,
            },
        );
        debug!(child = self.context.name(), %ds, size, "dataspace allocated");
        Ok(ds)
    }

    /// Free a dataspace.
    ///
    /// The call is forwarded even if the dataspace was never recorded. Its
    /// backing copy is released by the next checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn free(&self, ds: Badge) -> Result<()> {
        if self.dataspaces.remove(ds).is_none() {
            warn!(child = self.context.name(), %ds, "free of unrecorded dataspace forwarded");
        }
        self.real.free(ds)
    }

    /// Exclude a dataspace from content copy because it backs a region map.
    pub fn mark_region_map_dataspace(&self, ds: Badge) {
        self.context.mark_region_map_dataspace(ds);
        if !self.dataspaces.update(ds, |record| record.is_region_map = true) {
            debug!(child = self.context.name(), %ds, "marked dataspace not allocated here");
        }
    }

    /// Donated quota.
    #[must_use]
    pub fn quota(&self) -> usize {
        self.real.quota()
    }

    /// Allocated bytes.
    #[must_use]
    pub fn used(&self) -> usize {
        self.real.used()
    }

    /// Free every live dataspace and its backing copy.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the real session; every
    /// dataspace is attempted regardless.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for record in self.dataspaces.drain() {
            let freed = self
                .real
                .free(record.badge)
                .and_then(|()| self.context.translations().release(record.badge));
            if let Err(err) = freed {
                warn!(child = self.context.name(), ds = %record.badge, %err, "dataspace not freed on close");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Checkpointable for RamSession {
    fn checkpoint(&self) -> Result<()> {
        let translations = self.context.translations();
        let mut merge = self.dataspaces.begin_merge();
        for stored in merge.records_mut().values_mut() {
            let record = &mut stored.record;
            if record.is_region_map || self.context.is_region_map_dataspace(record.badge) {
                record.is_region_map = true;
                record.backing = None;
                continue;
            }
            let size = self.context.memory().size(record.badge)?;
            record.backing = Some(translations.ensure_copied(record.badge, size)?);
        }
        let released: Vec<Badge> = merge.destroyed().keys().copied().collect();
        let backings: Vec<(Badge, Option<Badge>)> = merge
            .records_mut()
            .iter()
            .map(|(ds, stored)| (*ds, stored.record.backing))
            .collect();
        let summary = merge.commit();

        for ds in released {
            if let Err(err) = translations.release(ds) {
                warn!(child = self.context.name(), %ds, %err, "backing dataspace not released");
            }
        }
        for (ds, backing) in backings {
            self.dataspaces.update(ds, |record| record.backing = backing);
        }
        self.info.checkpoint();
        info!(child = self.context.name(), ?summary, "ram session checkpointed");
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.dataspaces
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        self.info.annotate(|record| kcaps.find_kcap_by_badge(record.badge));
    }
}
