//! Live-object records kept by the proxy sessions.
//!
//! One record type per monitored kernel-object kind. The hot copy of a
//! record lives in its session's live table and is mutated by intercepted
//! calls; a checkpoint stores a clone wrapped in [`Stored`].

use serde::{Deserialize, Serialize};

use super::capability::{Badge, Kcap};
use crate::kernel::{Address, Affinity, CacheAttr, ThreadState};

/// A record as captured by the last completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stored<T> {
    /// Kernel capability index resolved after the mapping pass.
    pub kcap: Kcap,
    /// The record contents at checkpoint time.
    pub record: T,
}

impl<T> Stored<T> {
    /// Wrap a record that has not been annotated yet.
    #[must_use]
    pub fn new(record: T) -> Self {
        Self {
            kcap: Kcap::INVALID,
            record,
        }
    }
}

/// Memory allocated through an intercepted RAM session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamDataspaceRecord {
    /// Dataspace badge.
    pub badge: Badge,
    /// Allocated before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Size in bytes.
    pub size: usize,
    /// Requested cache attribute.
    pub cache: CacheAttr,
    /// Dataspace backs a region map and is never content-copied.
    pub is_region_map: bool,
    /// Supervisor-owned copy of the content, once allocated.
    pub backing: Option<Badge>,
}

/// A dataspace attached into a region map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedRegionRecord {
    /// Badge of the attached dataspace.
    pub dataspace: Badge,
    /// Attached before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Size of the attached range in bytes.
    pub size: usize,
    /// Offset into the dataspace.
    pub offset: usize,
    /// Start address inside the region map.
    pub address: Address,
    /// Mapped executable.
    pub executable: bool,
    /// The dataspace is itself a region map (managed dataspace).
    pub managed: bool,
}

impl AttachedRegionRecord {
    /// Whether `addr` falls inside this region.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr - self.address < self.size as u64
    }
}

/// A region map created through an intercepted RM session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMapRecord {
    /// Region map badge.
    pub badge: Badge,
    /// Created before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Size of the managed address range.
    pub size: usize,
    /// Managed dataspace representing the region map.
    pub dataspace: Badge,
    /// Registered page-fault signal handler.
    pub fault_handler: Option<Badge>,
}

/// A thread created through an intercepted CPU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread badge.
    pub badge: Badge,
    /// Created before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Thread name as passed to `create_thread`.
    pub name: String,
    /// Protection domain the thread executes in.
    pub pd: Badge,
    /// Scheduling weight.
    pub weight: u32,
    /// Address of the user-level thread control block.
    pub utcb: Address,
    /// `start` has been called.
    pub started: bool,
    /// Paused by the child itself (not by the supervisor).
    pub paused: bool,
    /// Single-stepping enabled.
    pub single_step: bool,
    /// CPU placement.
    pub affinity: Affinity,
    /// Exception signal handler.
    pub exception_sigh: Option<Badge>,
    /// Register state read during the last checkpoint.
    pub registers: Option<ThreadState>,
}

/// A signal source allocated through the PD session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSourceRecord {
    /// Signal source badge.
    pub badge: Badge,
    /// Allocated before the child finished bootstrapping.
    pub bootstrapped: bool,
}

/// A signal context allocated through the PD session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalContextRecord {
    /// Signal context badge.
    pub badge: Badge,
    /// Allocated before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Source the context delivers to.
    pub source: Badge,
    /// Imprint delivered with each signal.
    pub imprint: u64,
}

/// A native RPC capability allocated through the PD session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCapRecord {
    /// Capability badge.
    pub badge: Badge,
    /// Allocated before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Entrypoint the capability is bound to.
    pub entrypoint: Badge,
}

/// Bookkeeping common to every intercepted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Badge of the real session.
    pub badge: Badge,
    /// Session label as passed by the child.
    pub label: String,
    /// Opened before the child finished bootstrapping.
    pub bootstrapped: bool,
    /// Quota donated at creation plus all upgrades.
    pub ram_quota: usize,
}

/// Scalar state of a ROM session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomRecord {
    /// Dataspace handed out by the last `dataspace` call.
    pub dataspace: Option<Badge>,
    /// Update signal handler.
    pub sigh: Option<Badge>,
}

/// Scalar state of a timer session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    /// Last requested timeout in microseconds.
    pub timeout_us: u64,
    /// Timeout was requested as periodic.
    pub periodic: bool,
    /// Timeout signal handler.
    pub sigh: Option<Badge>,
}
