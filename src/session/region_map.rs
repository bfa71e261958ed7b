//! Region-map proxy and its checkpoint step.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::context::ChildContext;
use super::lock;
use super::tracked::{MergeSummary, TrackedObjects};
use crate::kernel::{Address, AttachRequest, RegionMapService};
use crate::models::records::AttachedRegionRecord;
use crate::models::report::RegionMapSnapshot;
use crate::models::Badge;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::Result;

/// Intercepts attach/detach on one region map.
pub struct RegionMap {
    name: String,
    real: Arc<dyn RegionMapService>,
    context: Arc<ChildContext>,
    regions: TrackedObjects<Address, AttachedRegionRecord>,
    fault_handler: Mutex<Option<Badge>>,
}

impl RegionMap {
    /// Wrap a real region map.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        real: Arc<dyn RegionMapService>,
        context: Arc<ChildContext>,
    ) -> Self {
        Self {
            name: name.into(),
            real,
            context,
            regions: TrackedObjects::new("attached region"),
            fault_handler: Mutex::new(None),
        }
    }

    /// Name used in snapshots and logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Badge of the real region map.
    #[must_use]
    pub fn badge(&self) -> Badge {
        self.real.badge()
    }

    /// Managed dataspace representing the region map.
    #[must_use]
    pub fn dataspace(&self) -> Badge {
        self.real.dataspace()
    }

    /// Size of the address range.
    #[must_use]
    pub fn size(&self) -> usize {
        self.real.size()
    }

    /// Attach a dataspace and record the region.
    ///
    /// # Errors
    ///
    /// Returns the real region map's error unchanged.
    pub fn attach(&self, ds: Badge, request: AttachRequest) -> Result<Address> {
        let address = self.real.attach(ds, request)?;
        let size = if request.size == 0 {
            self.context
                .memory()
                .size(ds)
                .map_or(0, |size| size.saturating_sub(request.offset))
        } else {
            request.size
        };
        self.regions.insert(
            address,
            AttachedRegionRecord {
                dataspace: ds,
                bootstrapped: self.context.bootstrapping(),
                size,
                offset: request.offset,
                address,
                executable: request.executable,
                managed: self.context.region_map(ds).is_some(),
            },
        );
        debug!(map = %self.name, %ds, address, size, "region attached");
        Ok(address)
    }

    /// Detach the region at `address`.
    ///
    /// The call is forwarded even if no region was recorded there.
    ///
    /// # Errors
    ///
    /// Returns the real region map's error unchanged.
    pub fn detach(&self, address: Address) -> Result<()> {
        if self.regions.remove(address).is_none() {
            warn!(map = %self.name, address, "detach of unrecorded region forwarded");
        }
        self.real.detach(address)
    }

    /// Register a page-fault handler.
    ///
    /// # Errors
    ///
    /// Returns the real region map's error unchanged.
    pub fn fault_handler(&self, sigh: Badge) -> Result<()> {
        self.real.fault_handler(sigh)?;
        *lock(&self.fault_handler) = Some(sigh);
        Ok(())
    }

    /// Registered page-fault handler.
    #[must_use]
    pub fn registered_fault_handler(&self) -> Option<Badge> {
        *lock(&self.fault_handler)
    }

    /// Live region containing `address`.
    #[must_use]
    pub fn resolve(&self, address: Address) -> Option<AttachedRegionRecord> {
        self.regions.find(|region| region.contains(address))
    }

    /// Live regions.
    #[must_use]
    pub fn regions(&self) -> &TrackedObjects<Address, AttachedRegionRecord> {
        &self.regions
    }

    /// Merge attach/detach activity into the snapshot and copy the content
    /// of every plain dataspace still attached.
    ///
    /// Regions whose dataspace no longer exists, e.g. RAM freed while still
    /// attached, are dropped from the live table and the snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first copy failure; the previous snapshot is kept.
    pub fn checkpoint(&self) -> Result<MergeSummary> {
        let translations = self.context.translations();
        let memory = self.context.memory();
        let mut merge = self.regions.begin_merge();
        let mut stale = Vec::new();
        for (address, stored) in merge.records_mut() {
            let region = &mut stored.record;
            region.managed = self.context.region_map(region.dataspace).is_some();
            if region.managed || self.context.is_region_map_dataspace(region.dataspace) {
                continue;
            }
            match memory.size(region.dataspace) {
                Ok(size) => {
                    translations.ensure_copied(region.dataspace, size)?;
                }
                Err(err) => {
                    warn!(map = %self.name, address, ds = %region.dataspace, %err, "dropping region of vanished dataspace");
                    stale.push(*address);
                }
            }
        }
        for address in stale {
            merge.records_mut().remove(&address);
            self.regions.forget(address);
        }
        let summary = merge.commit();
        debug!(map = %self.name, ?summary, "region map checkpointed");
        Ok(summary)
    }

    /// Set the kcap of every stored region from its dataspace badge.
    pub fn annotate(&self, kcaps: &KcapTable) {
        self.regions
            .annotate(|region| kcaps.find_kcap_by_badge(region.dataspace));
    }

    /// Regions as of the last checkpoint.
    #[must_use]
    pub fn snapshot(&self) -> RegionMapSnapshot {
        RegionMapSnapshot {
            name: self.name.clone(),
            badge: self.badge(),
            regions: self.regions.snapshot(),
        }
    }
}
