//! Interfaces of the real kernel sessions the supervisor forwards to.
//!
//! Every proxy session wraps one of these services and forwards each
//! call with identical argument and result semantics. The traits are
//! synchronous because a forwarded call is a blocking kernel RPC.
//! [`sim`] provides an in-memory implementation.

pub mod sim;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::session::SessionKind;
use crate::models::Badge;
use crate::Result;

/// Virtual address inside a region map.
pub type Address = u64;

/// Page granularity of attachments and copies.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to whole pages.
#[must_use]
pub fn round_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Cache attribute requested for a dataspace allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheAttr {
    /// Normal cached memory.
    #[default]
    Cached,
    /// Write-combined memory.
    WriteCombined,
    /// Uncached memory.
    Uncached,
}

/// CPU placement of a thread within the session's affinity space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    /// Horizontal position.
    pub xpos: u32,
    /// Vertical position.
    pub ypos: u32,
}

/// Register state of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    /// General-purpose registers.
    pub r: [u64; 13],
    /// Stack pointer.
    pub sp: u64,
    /// Link register.
    pub lr: u64,
    /// Instruction pointer.
    pub ip: u64,
    /// Status register.
    pub cpsr: u64,
}

/// Parameters of a region-map attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachRequest {
    /// Bytes to attach; zero attaches the remainder of the dataspace.
    pub size: usize,
    /// Offset into the dataspace.
    pub offset: usize,
    /// Attach at `local_addr` instead of letting the kernel choose.
    pub use_local_addr: bool,
    /// Requested address when `use_local_addr` is set.
    pub local_addr: Address,
    /// Map executable.
    pub executable: bool,
}

impl AttachRequest {
    /// Attach the whole dataspace at a fixed address.
    #[must_use]
    pub fn at(local_addr: Address) -> Self {
        Self {
            use_local_addr: true,
            local_addr,
            ..Self::default()
        }
    }
}

/// An object the kernel identifies by badge.
pub trait KernelObject: Send + Sync {
    /// Badge of the object.
    fn badge(&self) -> Badge;
}

/// Memory allocation service.
pub trait RamService: KernelObject {
    /// Allocate a dataspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when the quota is used up.
    fn alloc(&self, size: usize, cache: CacheAttr) -> Result<Badge>;

    /// Release a dataspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the dataspace is not owned by the session.
    fn free(&self, ds: Badge) -> Result<()>;

    /// Donated quota in bytes.
    fn quota(&self) -> usize;

    /// Bytes currently allocated.
    fn used(&self) -> usize;
}

/// A local mapping of a dataspace. Dropping it detaches the dataspace.
pub trait Mapping: Send {
    /// Mapped dataspace.
    fn dataspace(&self) -> Badge;

    /// Size of the mapping in bytes.
    fn size(&self) -> usize;

    /// Copy bytes out of the mapping.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the range lies outside the dataspace.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Copy bytes into the mapping.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the range lies outside the dataspace.
    fn write(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Access to dataspace content from the supervisor's own address space.
pub trait DataspaceAccess: Send + Sync {
    /// Attach a dataspace locally.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the dataspace does not exist or cannot
    /// be mapped.
    fn attach(&self, ds: Badge) -> Result<Box<dyn Mapping>>;

    /// Size of a dataspace, including managed dataspaces.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the dataspace does not exist.
    fn size(&self, ds: Badge) -> Result<usize>;
}

/// A virtual address range into which dataspaces are attached.
pub trait RegionMapService: KernelObject {
    /// Managed dataspace that represents this region map.
    fn dataspace(&self) -> Badge;

    /// Size of the address range.
    fn size(&self) -> usize;

    /// Attach a dataspace and return its start address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` for unknown dataspaces or conflicting ranges.
    fn attach(&self, ds: Badge, request: AttachRequest) -> Result<Address>;

    /// Detach the region starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if no region starts at `addr`.
    fn detach(&self, addr: Address) -> Result<()>;

    /// Register a page-fault handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the handler is rejected.
    fn fault_handler(&self, sigh: Badge) -> Result<()>;
}

/// Region-map factory service.
pub trait RmService: KernelObject {
    /// Create a region map of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when no more maps can be created.
    fn create(&self, size: usize) -> Result<Arc<dyn RegionMapService>>;

    /// Destroy a region map.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the map is unknown.
    fn destroy(&self, region_map: Badge) -> Result<()>;
}

/// Protection-domain service.
pub trait PdService: KernelObject {
    /// Region map of the whole virtual address space.
    fn address_space(&self) -> Arc<dyn RegionMapService>;

    /// Region map of the stack area.
    fn stack_area(&self) -> Arc<dyn RegionMapService>;

    /// Region map of the linker area.
    fn linker_area(&self) -> Arc<dyn RegionMapService>;

    /// Allocate a signal source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when the PD is out of caps.
    fn alloc_signal_source(&self) -> Result<Badge>;

    /// Free a signal source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the source is unknown.
    fn free_signal_source(&self, source: Badge) -> Result<()>;

    /// Allocate a signal context bound to `source`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the source is unknown.
    fn alloc_context(&self, source: Badge, imprint: u64) -> Result<Badge>;

    /// Free a signal context.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the context is unknown.
    fn free_context(&self, context: Badge) -> Result<()>;

    /// Submit `count` signals to a context.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the context is unknown.
    fn submit(&self, context: Badge, count: u32) -> Result<()>;

    /// Allocate an RPC capability for an entrypoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when the PD is out of caps.
    fn alloc_rpc_cap(&self, entrypoint: Badge) -> Result<Badge>;

    /// Free an RPC capability.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the capability is unknown.
    fn free_rpc_cap(&self, cap: Badge) -> Result<()>;
}

/// A kernel thread.
pub trait CpuThreadService: KernelObject {
    /// Start executing at `ip` with stack pointer `sp`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread was already started.
    fn start(&self, ip: Address, sp: Address) -> Result<()>;

    /// Suspend execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread is gone.
    fn pause(&self) -> Result<()>;

    /// Continue execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread is gone.
    fn resume(&self) -> Result<()>;

    /// Read the register state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the state cannot be read.
    fn state(&self) -> Result<ThreadState>;

    /// Overwrite the register state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the state cannot be written.
    fn set_state(&self, state: ThreadState) -> Result<()>;

    /// Enable or disable single stepping.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread is gone.
    fn single_step(&self, enabled: bool) -> Result<()>;

    /// Migrate to another CPU.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the location is outside the affinity space.
    fn affinity(&self, location: Affinity) -> Result<()>;

    /// Register an exception signal handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread is gone.
    fn exception_sigh(&self, sigh: Badge) -> Result<()>;
}

/// Thread-creation service.
pub trait CpuService: KernelObject {
    /// Create a thread in the PD identified by `pd`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when no more threads fit the quota.
    fn create_thread(
        &self,
        pd: Badge,
        name: &str,
        affinity: Affinity,
        weight: u32,
        utcb: Address,
    ) -> Result<Arc<dyn CpuThreadService>>;

    /// Destroy a thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the thread is unknown.
    fn kill_thread(&self, thread: Badge) -> Result<()>;

    /// Default exception handler for all threads of the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the handler is rejected.
    fn exception_sigh(&self, sigh: Badge) -> Result<()>;
}

/// Read-only module service.
pub trait RomService: KernelObject {
    /// Dataspace holding the module content.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the module does not exist.
    fn dataspace(&self) -> Result<Badge>;

    /// Refresh the content in place; returns whether that succeeded.
    fn update(&self) -> bool;

    /// Register a module-changed signal handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the handler is rejected.
    fn sigh(&self, sigh: Badge) -> Result<()>;
}

/// Log output service.
pub trait LogService: KernelObject {
    /// Write a log line; returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the line cannot be written.
    fn write(&self, line: &str) -> Result<usize>;
}

/// Timeout service.
pub trait TimerService: KernelObject {
    /// Request one timeout signal after `us` microseconds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if no handler is registered.
    fn trigger_once(&self, us: u64) -> Result<()>;

    /// Request a timeout signal every `us` microseconds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if no handler is registered.
    fn trigger_periodic(&self, us: u64) -> Result<()>;

    /// Register the timeout signal handler.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the handler is rejected.
    fn sigh(&self, sigh: Badge) -> Result<()>;

    /// Milliseconds since the session was opened.
    fn elapsed_ms(&self) -> u64;
}

/// The parent environment: opens real sessions on behalf of the supervisor.
pub trait Kernel: Send + Sync {
    /// Open a PD session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the session is refused.
    fn open_pd(&self, label: &str) -> Result<Arc<dyn PdService>>;

    /// Open a RAM session with `ram_quota` bytes of quota.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` if the quota cannot be donated.
    fn open_ram(&self, label: &str, ram_quota: usize) -> Result<Arc<dyn RamService>>;

    /// Open an RM session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the session is refused.
    fn open_rm(&self, label: &str) -> Result<Arc<dyn RmService>>;

    /// Open a CPU session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the session is refused.
    fn open_cpu(&self, label: &str) -> Result<Arc<dyn CpuService>>;

    /// Open a ROM session for the module named by the label.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the module does not exist.
    fn open_rom(&self, label: &str) -> Result<Arc<dyn RomService>>;

    /// Open a LOG session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the session is refused.
    fn open_log(&self, label: &str) -> Result<Arc<dyn LogService>>;

    /// Open a timer session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the session is refused.
    fn open_timer(&self, label: &str) -> Result<Arc<dyn TimerService>>;

    /// Donate additional quota to an open session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session is open.
    fn upgrade(&self, kind: SessionKind, label: &str, ram_quota: usize) -> Result<()>;

    /// Local dataspace access of the supervisor.
    fn memory(&self) -> Arc<dyn DataspaceAccess>;

    /// The supervisor's own RAM, used for checkpoint copies.
    fn supervisor_ram(&self) -> Arc<dyn RamService>;
}
