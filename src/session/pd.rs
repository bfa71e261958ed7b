//! PD session proxy.
//!
//! Owns the proxies of the three built-in region maps and tracks signal
//! sources, signal contexts and native RPC capabilities.

use std::sync::Arc;

use tracing::{info, warn};

use super::context::ChildContext;
use super::region_map::RegionMap;
use super::session_info;
use super::tracked::{TrackedObjects, TrackedValue};
use crate::kernel::PdService;
use crate::models::records::{
    NativeCapRecord, SessionRecord, SignalContextRecord, SignalSourceRecord,
};
use crate::models::report::RegionMapSnapshot;
use crate::models::session::SessionArgs;
use crate::models::Badge;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts the protection domain of one child.
pub struct PdSession {
    real: Arc<dyn PdService>,
    context: Arc<ChildContext>,
    info: TrackedValue<SessionRecord>,
    address_space: Arc<RegionMap>,
    stack_area: Arc<RegionMap>,
    linker_area: Arc<RegionMap>,
    signal_sources: TrackedObjects<Badge, SignalSourceRecord>,
    signal_contexts: TrackedObjects<Badge, SignalContextRecord>,
    native_caps: TrackedObjects<Badge, NativeCapRecord>,
}

impl PdSession {
    /// Wrap a real PD session and register its region maps with the context.
    #[must_use]
    pub fn new(real: Arc<dyn PdService>, context: Arc<ChildContext>, args: &SessionArgs) -> Self {
        let wrap = |name: &str, map| {
            let map = Arc::new(RegionMap::new(name, map, Arc::clone(&context)));
            context.register_region_map(&map);
            map
        };
        let address_space = wrap("address_space", real.address_space());
        let stack_area = wrap("stack_area", real.stack_area());
        let linker_area = wrap("linker_area", real.linker_area());
        Self {
            info: session_info(real.badge(), args, &context),
            real,
            context,
            address_space,
            stack_area,
            linker_area,
            signal_sources: TrackedObjects::new("signal source"),
            signal_contexts: TrackedObjects::new("signal context"),
            native_caps: TrackedObjects::new("native capability"),
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

    /// Region map of the whole address space.
    #[must_use]
    pub fn address_space(&self) -> &Arc<RegionMap> {
        &self.address_space
    }

    /// Region map of the stack area.
    #[must_use]
    pub fn stack_area(&self) -> &Arc<RegionMap> {
        &self.stack_area
    }

    /// Region map of the linker area.
    #[must_use]
    pub fn linker_area(&self) -> &Arc<RegionMap> {
        &self.linker_area
    }

    fn region_maps(&self) -> [&Arc<RegionMap>; 3] {
        [&self.address_space, &self.stack_area, &self.linker_area]
    }

    /// Signal sources.
    #[must_use]
    pub fn signal_sources(&self) -> &TrackedObjects<Badge, SignalSourceRecord> {
        &self.signal_sources
    }

    /// Signal contexts.
    #[must_use]
    pub fn signal_contexts(&self) -> &TrackedObjects<Badge, SignalContextRecord> {
        &self.signal_contexts
    }

    /// Native RPC capabilities.
    #[must_use]
    pub fn native_caps(&self) -> &TrackedObjects<Badge, NativeCapRecord> {
        &self.native_caps
    }

    /// Allocate a signal source.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn alloc_signal_source(&self) -> Result<Badge> {
        let source = self.real.alloc_signal_source()?;
        self.signal_sources.insert(
            source,
            SignalSourceRecord {
                badge: source,
                bootstrapped: self.context.bootstrapping(),
            },
        );
        Ok(source)
    }

    /// Free a signal source; forwarded even if unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn free_signal_source(&self, source: Badge) -> Result<()> {
        if self.signal_sources.remove(source).is_none() {
            warn!(child = self.context.name(), %source, "free of unrecorded signal source forwarded");
        }
        self.real.free_signal_source(source)
    }

    /// Allocate a signal context delivering to `source`.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn alloc_context(&self, source: Badge, imprint: u64) -> Result<Badge> {
        let context = self.real.alloc_context(source, imprint)?;
        self.signal_contexts.insert(
            context,
            SignalContextRecord {
                badge: context,
                bootstrapped: self.context.bootstrapping(),
                source,
                imprint,
            },
        );
        Ok(context)
    }

    /// Free a signal context; forwarded even if unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn free_context(&self, context: Badge) -> Result<()> {
        if self.signal_contexts.remove(context).is_none() {
            warn!(child = self.context.name(), %context, "free of unrecorded signal context forwarded");
        }
        self.real.free_context(context)
    }

    /// Submit signals to a context.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn submit(&self, context: Badge, count: u32) -> Result<()> {
        self.real.submit(context, count)
    }

    /// Allocate an RPC capability for `entrypoint`.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn alloc_rpc_cap(&self, entrypoint: Badge) -> Result<Badge> {
        let cap = self.real.alloc_rpc_cap(entrypoint)?;
        self.native_caps.insert(
            cap,
            NativeCapRecord {
                badge: cap,
                bootstrapped: self.context.bootstrapping(),
                entrypoint,
            },
        );
        Ok(cap)
    }

    /// Free an RPC capability; forwarded even if unrecorded.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn free_rpc_cap(&self, cap: Badge) -> Result<()> {
        if self.native_caps.remove(cap).is_none() {
            warn!(child = self.context.name(), %cap, "free of unrecorded rpc capability forwarded");
        }
        self.real.free_rpc_cap(cap)
    }

    /// Snapshots of the three built-in region maps.
    #[must_use]
    pub fn region_map_snapshots(&self) -> Vec<RegionMapSnapshot> {
        self.region_maps()
            .into_iter()
            .map(|map| map.snapshot())
            .collect()
    }

    /// Unregister the built-in region maps from the child context.
    pub fn close(&self) {
        for map in self.region_maps() {
            self.context.unregister_region_map(map.dataspace());
        }
    }
}

impl Checkpointable for PdSession {
    fn checkpoint(&self) -> Result<()> {
        let sources = self.signal_sources.begin_merge().commit();
        let contexts = self.signal_contexts.begin_merge().commit();
        let caps = self.native_caps.begin_merge().commit();
        for map in self.region_maps() {
            map.checkpoint()?;
        }
        self.info.checkpoint();
        info!(
            child = self.context.name(),
            signal_sources = sources.total,
            signal_contexts = contexts.total,
            native_caps = caps.total,
            "pd session checkpointed"
        );
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.signal_sources
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        self.signal_contexts
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        self.native_caps
            .annotate(|record| kcaps.find_kcap_by_badge(record.badge));
        for map in self.region_maps() {
            map.annotate(kcaps);
        }
        self.info.annotate(|record| kcaps.find_kcap_by_badge(record.badge));
    }
}
