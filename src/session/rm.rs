//! RM session proxy: creation and destruction of region maps.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::context::ChildContext;
use super::region_map::RegionMap;
use super::tracked::{TrackedObjects, TrackedValue};
use super::{lock, session_info};
use crate::kernel::RmService;
use crate::models::records::{RegionMapRecord, SessionRecord};
use crate::models::report::RegionMapSnapshot;
use crate::models::session::SessionArgs;
use crate::models::Badge;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts region-map creation of one child.
pub struct RmSession {
    real: Arc<dyn RmService>,
    context: Arc<ChildContext>,
    info: TrackedValue<SessionRecord>,
    region_maps: TrackedObjects<Badge, RegionMapRecord>,
    proxies: Mutex<BTreeMap<Badge, Arc<RegionMap>>>,
}

impl RmSession {
    /// Wrap a real RM session.
    #[must_use]
    pub fn new(real: Arc<dyn RmService>, context: Arc<ChildContext>, args: &SessionArgs) -> Self {
        Self {
            info: session_info(real.badge(), args, &context),
            real,
            context,
            region_maps: TrackedObjects::new("region map"),
            proxies: Mutex::new(BTreeMap::new()),
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

    /// Region-map records.
    #[must_use]
    pub fn region_maps(&self) -> &TrackedObjects<Badge, RegionMapRecord> {
        &self.region_maps
    }

    /// Proxy of a live region map.
    #[must_use]
    pub fn region_map(&self, badge: Badge) -> Option<Arc<RegionMap>> {
        lock(&self.proxies).get(&badge).cloned()
    }

    fn proxies(&self) -> Vec<Arc<RegionMap>> {
        lock(&self.proxies).values().cloned().collect()
    }

    /// Create a region map of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn create(&self, size: usize) -> Result<Arc<RegionMap>> {
        let real = self.real.create(size)?;
        let badge = real.badge();
        let map = Arc::new(RegionMap::new(
            format!("region_map:{badge}"),
            real,
            Arc::clone(&self.context),
        ));
        self.context.register_region_map(&map);
        self.region_maps.insert(
            badge,
            RegionMapRecord {
                badge,
                bootstrapped: self.context.bootstrapping(),
                size: map.size(),
                dataspace: map.dataspace(),
                fault_handler: None,
            },
        );
        lock(&self.proxies).insert(badge, Arc::clone(&map));
        debug!(child = self.context.name(), %badge, size, "region map created");
        Ok(map)
    }

    /// Destroy a region map; forwarded even if unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn destroy(&self, region_map: Badge) -> Result<()> {
        if let Some(map) = lock(&self.proxies).remove(&region_map) {
            self.context.unregister_region_map(map.dataspace());
        }
        if self.region_maps.remove(region_map).is_none() {
            warn!(child = self.context.name(), %region_map, "destroy of unrecorded region map forwarded");
        }
        self.real.destroy(region_map)
    }

    /// Snapshots of every live region map.
    #[must_use]
    pub fn region_map_snapshots(&self) -> Vec<RegionMapSnapshot> {
        self.proxies().iter().map(|map| map.snapshot()).collect()
    }

    /// Destroy every live region map.
    ///
    /// # Errors
    ///
    /// Returns the first error; every region map is attempted regardless.
    pub fn close(&self) -> Result<()> {
        let maps: Vec<Badge> = lock(&self.proxies).keys().copied().collect();
        let mut first_err = None;
        for map in maps {
            if let Err(err) = self.destroy(map) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Checkpointable for RmSession {
    fn checkpoint(&self) -> Result<()> {
        let mut merge = self.region_maps.begin_merge();
        for (badge, stored) in merge.records_mut() {
            if let Some(map) = self.region_map(*badge) {
                stored.record.fault_handler = map.registered_fault_handler();
            }
        }
        let summary = merge.commit();
        for map in self.proxies() {
            map.checkpoint()?;
        }
        self.info.checkpoint();
        info!(child = self.context.name(), ?summary, "rm session checkpointed");
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.region_maps
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        for map in self.proxies() {
            map.annotate(kcaps);
        }
        self.info.annotate(|record| kcaps.find_kcap_by_badge(record.badge));
    }
}
