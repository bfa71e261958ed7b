//! Capability-table mapper: badge to kcap translation.
//!
//! The kernel keeps a table of capability slots inside the child's own
//! address space. The mapper resolves the table's address through the
//! PD's region maps, attaches the backing dataspace locally for the
//! duration of the scan, and records the kcap of every used slot.
//!
//! Slot layout (all offsets configurable):
//!
//! | byte             | meaning                                  |
//! |------------------|------------------------------------------|
//! | 0                | reference count, zero marks a free slot  |
//! | `badge_offset`   | 16-bit little-endian badge               |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use super::worker::Checkpointable;
use crate::config::CapTableConfig;
use crate::kernel::{Address, Mapping};
use crate::models::{Badge, Kcap};
use crate::session::context::ChildContext;
use crate::session::lock;
use crate::session::pd::PdSession;
use crate::{AppError, Result};

/// Region-map nesting followed before giving up on a lookup.
const MAX_NESTING: usize = 8;

/// Badge-to-kcap table built by one mapper run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KcapTable {
    entries: BTreeMap<Badge, Kcap>,
}

impl KcapTable {
    /// Kcap of `badge`, or [`Kcap::INVALID`] if unknown.
    #[must_use]
    pub fn find_kcap_by_badge(&self, badge: Badge) -> Kcap {
        self.entries.get(&badge).copied().unwrap_or(Kcap::INVALID)
    }

    /// Number of used slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no slot is used.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by badge.
    pub fn iter(&self) -> impl Iterator<Item = (Badge, Kcap)> + '_ {
        self.entries.iter().map(|(badge, kcap)| (*badge, *kcap))
    }
}

/// Parse raw table bytes into a kcap table.
///
/// Trailing bytes that do not fill a whole slot are ignored.
#[must_use]
pub fn parse_cap_table(bytes: &[u8], layout: &CapTableConfig) -> KcapTable {
    let mut entries = BTreeMap::new();
    for (slot, chunk) in bytes.chunks_exact(layout.slot_size).enumerate() {
        if chunk[0] == 0 {
            continue;
        }
        let badge = u16::from_le_bytes([chunk[layout.badge_offset], chunk[layout.badge_offset + 1]]);
        if badge == 0 {
            continue;
        }
        let kcap = Kcap((slot as u64) << layout.kcap_shift);
        entries.insert(Badge(u64::from(badge)), kcap);
    }
    KcapTable { entries }
}

/// Write one used slot into a mapped table starting at `table_offset`.
///
/// # Errors
///
/// Returns `AppError::Config` if the slot or badge does not fit the
/// layout, or the mapping's error if the write fails.
pub fn write_cap_slot(
    mapping: &dyn Mapping,
    layout: &CapTableConfig,
    table_offset: usize,
    slot: usize,
    badge: Badge,
) -> Result<()> {
    if slot >= layout.slot_count {
        return Err(AppError::Config(format!(
            "slot {slot} outside table of {} slots",
            layout.slot_count
        )));
    }
    let raw = u16::try_from(badge.raw())
        .map_err(|_| AppError::Config(format!("badge {badge} does not fit a table slot")))?;
    let mut entry = vec![0; layout.slot_size];
    entry[0] = 1;
    entry[layout.badge_offset..layout.badge_offset + 2].copy_from_slice(&raw.to_le_bytes());
    mapping.write(table_offset + slot * layout.slot_size, &entry)
}

/// Rebuilds a child's kcap table on every checkpoint.
pub struct CapabilityMapper {
    pd: Arc<PdSession>,
    context: Arc<ChildContext>,
    layout: CapTableConfig,
    table: Mutex<KcapTable>,
}

impl CapabilityMapper {
    /// Create a mapper reading the table of the child owning `pd`.
    #[must_use]
    pub fn new(pd: Arc<PdSession>, context: Arc<ChildContext>, layout: CapTableConfig) -> Self {
        Self {
            pd,
            context,
            layout,
            table: Mutex::new(KcapTable::default()),
        }
    }

    /// Kcap of `badge` from the last run, or [`Kcap::INVALID`].
    #[must_use]
    pub fn find_kcap_by_badge(&self, badge: Badge) -> Kcap {
        lock(&self.table).find_kcap_by_badge(badge)
    }

    /// Table built by the last run.
    #[must_use]
    pub fn table(&self) -> KcapTable {
        lock(&self.table).clone()
    }

    /// Dataspace and offset holding the table.
    fn locate(&self) -> Result<(Badge, usize)> {
        let mut map = Arc::clone(self.pd.address_space());
        let mut address: Address = self.layout.base_address;
        for _ in 0..MAX_NESTING {
            let region = map.resolve(address).ok_or_else(|| {
                AppError::MissingDependency(format!(
                    "capability table: nothing attached at {address:#x} in {}",
                    map.name()
                ))
            })?;
            let inner = address - region.address + region.offset as u64;
            match self.context.region_map(region.dataspace) {
                Some(nested) => {
                    map = nested;
                    address = inner;
                }
                None => {
                    let offset = usize::try_from(inner).map_err(|_| {
                        AppError::MissingDependency(format!(
                            "capability table offset {inner:#x} out of range"
                        ))
                    })?;
                    return Ok((region.dataspace, offset));
                }
            }
        }
        Err(AppError::MissingDependency(format!(
            "capability table: region maps nested deeper than {MAX_NESTING}"
        )))
    }
}

impl Checkpointable for CapabilityMapper {
    fn checkpoint(&self) -> Result<()> {
        let (ds, offset) = self.locate()?;
        let mut bytes = vec![0; self.layout.table_size()];
        {
            let mapping = self.context.memory().attach(ds)?;
            mapping.read(offset, &mut bytes)?;
        }
        let table = parse_cap_table(&bytes, &self.layout);
        debug!(child = self.context.name(), %ds, offset, "capability table scanned");
        info!(child = self.context.name(), entries = table.len(), "kcap table rebuilt");
        *lock(&self.table) = table;
        Ok(())
    }
}
