//! Per-child state shared by all of a child's proxy sessions.
//!
//! Replaces any global "current session" pointer: sessions that need to
//! look at each other's structures go through the context they were
//! constructed with.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::lock;
use super::region_map::RegionMap;
use crate::kernel::{DataspaceAccess, RamService};
use crate::models::Badge;
use crate::orchestrator::translation::DataspaceTranslations;

/// State shared by the proxy sessions of one child.
pub struct ChildContext {
    name: String,
    bootstrapping: AtomicBool,
    memory: Arc<dyn DataspaceAccess>,
    translations: DataspaceTranslations,
    marked_dataspaces: Mutex<BTreeSet<Badge>>,
    region_maps: Mutex<BTreeMap<Badge, Weak<RegionMap>>>,
}

impl ChildContext {
    /// Create the context of child `name`.
    ///
    /// `supervisor_ram` backs the content copies taken at checkpoint time.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        memory: Arc<dyn DataspaceAccess>,
        supervisor_ram: Arc<dyn RamService>,
    ) -> Self {
        let name = name.into();
        Self {
            translations: DataspaceTranslations::new(
                name.clone(),
                supervisor_ram,
                Arc::clone(&memory),
            ),
            name,
            bootstrapping: AtomicBool::new(true),
            memory,
            marked_dataspaces: Mutex::new(BTreeSet::new()),
            region_maps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Child name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the child is still being set up by its environment.
    ///
    /// Objects created while this holds are recorded as bootstrapped.
    #[must_use]
    pub fn bootstrapping(&self) -> bool {
        self.bootstrapping.load(Ordering::SeqCst)
    }

    /// End the bootstrap phase.
    pub fn mark_bootstrapped(&self) {
        self.bootstrapping.store(false, Ordering::SeqCst);
    }

    /// Local dataspace access.
    #[must_use]
    pub fn memory(&self) -> &Arc<dyn DataspaceAccess> {
        &self.memory
    }

    /// Content copies of the child's dataspaces.
    #[must_use]
    pub fn translations(&self) -> &DataspaceTranslations {
        &self.translations
    }

    /// Flag a dataspace as region-map structure, excluded from content copy.
    pub fn mark_region_map_dataspace(&self, ds: Badge) {
        lock(&self.marked_dataspaces).insert(ds);
    }

    /// Whether a dataspace is excluded from content copy.
    #[must_use]
    pub fn is_region_map_dataspace(&self, ds: Badge) -> bool {
        lock(&self.marked_dataspaces).contains(&ds) || lock(&self.region_maps).contains_key(&ds)
    }

    /// Make a region map resolvable through its managed dataspace.
    pub fn register_region_map(&self, map: &Arc<RegionMap>) {
        lock(&self.region_maps).insert(map.dataspace(), Arc::downgrade(map));
    }

    /// Forget a region map registered with [`register_region_map`](Self::register_region_map).
    pub fn unregister_region_map(&self, ds: Badge) {
        lock(&self.region_maps).remove(&ds);
    }

    /// Region map whose managed dataspace is `ds`.
    #[must_use]
    pub fn region_map(&self, ds: Badge) -> Option<Arc<RegionMap>> {
        lock(&self.region_maps).get(&ds).and_then(Weak::upgrade)
    }
}
