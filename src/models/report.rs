//! Checkpoint cycle reports and per-child snapshot dumps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::Badge;
use super::records::{
    AttachedRegionRecord, NativeCapRecord, RamDataspaceRecord, RegionMapRecord, RomRecord,
    SessionRecord, SignalContextRecord, SignalSourceRecord, Stored, ThreadRecord, TimerRecord,
};
use super::translation::DataspaceTranslation;

/// How the per-unit checkpoint jobs of one cycle are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Start and join one unit at a time in dependency order.
    #[default]
    Sequential,
    /// Start every unit, then join every unit.
    Parallel,
}

/// Wall-clock time spent by one checkpoint unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTiming {
    /// Unit name (`pd`, `ram`, ..., `cap_mapper`).
    pub unit: String,
    /// Time spent in the unit's checkpoint job.
    pub elapsed_us: u64,
}

/// Outcome of one checkpoint pass for a single child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReport {
    /// Child name.
    pub child: String,
    /// Per-unit timings in completion order.
    pub units: Vec<UnitTiming>,
    /// Distinct dataspaces whose content was copied in this pass.
    pub copied_dataspaces: usize,
    /// Bytes copied in this pass.
    pub copied_bytes: u64,
    /// Entries in the rebuilt badge-to-kcap table.
    pub kcap_entries: usize,
}

/// Outcome of one checkpoint pass across all children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointReport {
    /// Monotonic checkpoint epoch.
    pub epoch: u64,
    /// Scheduling mode used.
    pub mode: CheckpointMode,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// Total wall-clock time of the pass.
    pub total_us: u64,
    /// Per-child results.
    pub children: Vec<ChildReport>,
}

/// Snapshot lists of one region map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMapSnapshot {
    /// Region map name.
    pub name: String,
    /// Region map badge.
    pub badge: Badge,
    /// Attached regions as of the last checkpoint.
    pub regions: Vec<Stored<AttachedRegionRecord>>,
}

/// Everything the last checkpoint captured for one child.
///
/// This is the hand-off to an external serializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSnapshot {
    /// Child name.
    pub child: String,
    /// Session bookkeeping of every intercepted session.
    pub sessions: Vec<Stored<SessionRecord>>,
    /// Allocated dataspaces.
    pub ram_dataspaces: Vec<Stored<RamDataspaceRecord>>,
    /// The PD's built-in region maps followed by RM-created ones.
    pub region_maps: Vec<RegionMapSnapshot>,
    /// RM-session-created region maps.
    pub rm_region_maps: Vec<Stored<RegionMapRecord>>,
    /// Threads.
    pub threads: Vec<Stored<ThreadRecord>>,
    /// Signal sources.
    pub signal_sources: Vec<Stored<SignalSourceRecord>>,
    /// Signal contexts.
    pub signal_contexts: Vec<Stored<SignalContextRecord>>,
    /// Native capabilities.
    pub native_caps: Vec<Stored<NativeCapRecord>>,
    /// ROM session state.
    pub rom: Option<Stored<RomRecord>>,
    /// Timer session state.
    pub timer: Option<Stored<TimerRecord>>,
    /// Content copies.
    pub translations: Vec<DataspaceTranslation>,
}
