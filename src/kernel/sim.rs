//! Deterministic in-memory kernel.
//!
//! Implements every service trait with plain data structures so the
//! supervisor can run without a microkernel underneath. Badges are drawn
//! from one global counter, dataspace content is real memory, and
//! counters expose allocation and attach activity to tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use super::{
    round_page, Address, Affinity, AttachRequest, CacheAttr, CpuService, CpuThreadService,
    DataspaceAccess, Kernel, KernelObject, LogService, Mapping, PdService, RamService,
    RegionMapService, RmService, RomService, ThreadState, TimerService,
};
use crate::models::session::SessionKind;
use crate::models::Badge;
use crate::session::lock;
use crate::{AppError, Result};

/// Size of a PD's whole address space.
pub const ADDRESS_SPACE_SIZE: usize = 0xc000_0000;
/// Size of the stack and linker areas.
pub const AREA_SIZE: usize = 0x1000_0000;
/// Where the linker area is attached in the address space.
pub const LINKER_AREA_BASE: Address = 0x3000_0000;
/// Where the stack area is attached in the address space.
pub const STACK_AREA_BASE: Address = 0x4000_0000;

const DEFAULT_SUPERVISOR_QUOTA: usize = 256 << 20;
const AFFINITY_WIDTH: u32 = 4;

/// Shared state behind every simulated service.
struct SimState {
    next_badge: AtomicU64,
    dataspaces: Mutex<BTreeMap<Badge, Arc<Mutex<Vec<u8>>>>>,
    managed: Mutex<BTreeMap<Badge, usize>>,
    rams: Mutex<BTreeMap<String, Arc<SimRam>>>,
    quotas: Mutex<BTreeMap<(SessionKind, String), usize>>,
    threads: Mutex<BTreeMap<Badge, Arc<SimThread>>>,
    roms: Mutex<BTreeMap<String, Vec<u8>>>,
    active_mappings: AtomicUsize,
    total_attaches: AtomicU64,
    allocations: AtomicU64,
}

impl SimState {
    fn badge(&self) -> Badge {
        Badge(self.next_badge.fetch_add(1, Ordering::SeqCst))
    }

    fn create_dataspace(&self, content: Vec<u8>) -> Badge {
        let badge = self.badge();
        lock(&self.dataspaces).insert(badge, Arc::new(Mutex::new(content)));
        self.allocations.fetch_add(1, Ordering::SeqCst);
        badge
    }

    fn create_managed(&self, size: usize) -> Badge {
        let badge = self.badge();
        lock(&self.managed).insert(badge, size);
        badge
    }

    fn dataspace_size(&self, ds: Badge) -> Result<usize> {
        if let Some(content) = lock(&self.dataspaces).get(&ds) {
            return Ok(lock(content).len());
        }
        lock(&self.managed)
            .get(&ds)
            .copied()
            .ok_or_else(|| AppError::Kernel(format!("invalid dataspace {ds}")))
    }
}

/// In-memory kernel implementing every service trait.
#[derive(Clone)]
pub struct SimKernel {
    state: Arc<SimState>,
    supervisor_ram: Arc<SimRam>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// Construct a kernel with a 256 MiB supervisor quota.
    #[must_use]
    pub fn new() -> Self {
        Self::with_supervisor_quota(DEFAULT_SUPERVISOR_QUOTA)
    }

    /// Construct a kernel whose supervisor RAM holds `quota` bytes.
    #[must_use]
    pub fn with_supervisor_quota(quota: usize) -> Self {
        let state = Arc::new(SimState {
            next_badge: AtomicU64::new(1),
            dataspaces: Mutex::new(BTreeMap::new()),
            managed: Mutex::new(BTreeMap::new()),
            rams: Mutex::new(BTreeMap::new()),
            quotas: Mutex::new(BTreeMap::new()),
            threads: Mutex::new(BTreeMap::new()),
            roms: Mutex::new(BTreeMap::new()),
            active_mappings: AtomicUsize::new(0),
            total_attaches: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        });
        let supervisor_ram = Arc::new(SimRam::new(Arc::clone(&state), quota));
        Self {
            state,
            supervisor_ram,
        }
    }

    /// Provide a ROM module.
    pub fn add_rom(&self, name: &str, content: &[u8]) {
        lock(&self.state.roms).insert(name.to_owned(), content.to_vec());
    }

    /// Local mappings currently attached.
    #[must_use]
    pub fn active_mappings(&self) -> usize {
        self.state.active_mappings.load(Ordering::SeqCst)
    }

    /// Local attaches performed so far.
    #[must_use]
    pub fn total_attaches(&self) -> u64 {
        self.state.total_attaches.load(Ordering::SeqCst)
    }

    /// Dataspaces allocated so far, including freed ones.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.state.allocations.load(Ordering::SeqCst)
    }

    /// Whether a dataspace currently exists.
    #[must_use]
    pub fn dataspace_exists(&self, ds: Badge) -> bool {
        lock(&self.state.dataspaces).contains_key(&ds)
    }

    /// Copy of a dataspace's content.
    #[must_use]
    pub fn content(&self, ds: Badge) -> Option<Vec<u8>> {
        lock(&self.state.dataspaces)
            .get(&ds)
            .map(|content| lock(content).clone())
    }

    /// Whether the kernel thread is currently suspended.
    #[must_use]
    pub fn thread_paused(&self, thread: Badge) -> Option<bool> {
        lock(&self.state.threads)
            .get(&thread)
            .map(|t| lock(&t.inner).paused)
    }

    /// Number of times the kernel thread was suspended.
    #[must_use]
    pub fn thread_pause_count(&self, thread: Badge) -> Option<u64> {
        lock(&self.state.threads)
            .get(&thread)
            .map(|t| lock(&t.inner).pause_calls)
    }

    fn track_quota(&self, kind: SessionKind, label: &str) {
        lock(&self.state.quotas).insert((kind, label.to_owned()), 0);
    }
}

impl Kernel for SimKernel {
    fn open_pd(&self, label: &str) -> Result<Arc<dyn PdService>> {
        self.track_quota(SessionKind::Pd, label);
        Ok(Arc::new(SimPd::new(Arc::clone(&self.state))))
    }

    fn open_ram(&self, label: &str, ram_quota: usize) -> Result<Arc<dyn RamService>> {
        let ram = Arc::new(SimRam::new(Arc::clone(&self.state), ram_quota));
        lock(&self.state.rams).insert(label.to_owned(), Arc::clone(&ram));
        Ok(ram)
    }

    fn open_rm(&self, label: &str) -> Result<Arc<dyn RmService>> {
        self.track_quota(SessionKind::Rm, label);
        Ok(Arc::new(SimRm {
            badge: self.state.badge(),
            state: Arc::clone(&self.state),
            maps: Mutex::new(BTreeMap::new()),
        }))
    }

    fn open_cpu(&self, label: &str) -> Result<Arc<dyn CpuService>> {
        self.track_quota(SessionKind::Cpu, label);
        Ok(Arc::new(SimCpu {
            badge: self.state.badge(),
            state: Arc::clone(&self.state),
            threads: Mutex::new(BTreeMap::new()),
            exception_sigh: Mutex::new(None),
        }))
    }

    fn open_rom(&self, label: &str) -> Result<Arc<dyn RomService>> {
        let module = label.rsplit(" -> ").next().unwrap_or(label).trim();
        let content = lock(&self.state.roms)
            .get(module)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("rom module '{module}'")))?;
        self.track_quota(SessionKind::Rom, label);
        let dataspace = self.state.create_dataspace(content);
        Ok(Arc::new(SimRom {
            badge: self.state.badge(),
            dataspace,
            sigh: Mutex::new(None),
        }))
    }

    fn open_log(&self, label: &str) -> Result<Arc<dyn LogService>> {
        self.track_quota(SessionKind::Log, label);
        Ok(Arc::new(SimLog {
            badge: self.state.badge(),
            label: label.to_owned(),
        }))
    }

    fn open_timer(&self, label: &str) -> Result<Arc<dyn TimerService>> {
        self.track_quota(SessionKind::Timer, label);
        Ok(Arc::new(SimTimer {
            badge: self.state.badge(),
            opened: Instant::now(),
            sigh: Mutex::new(None),
        }))
    }

    fn upgrade(&self, kind: SessionKind, label: &str, ram_quota: usize) -> Result<()> {
        if kind == SessionKind::Ram {
            let rams = lock(&self.state.rams);
            let ram = rams
                .get(label)
                .ok_or_else(|| AppError::NotFound(format!("RAM session '{label}'")))?;
            ram.quota.fetch_add(ram_quota, Ordering::SeqCst);
            return Ok(());
        }
        let mut quotas = lock(&self.state.quotas);
        let quota = quotas
            .get_mut(&(kind, label.to_owned()))
            .ok_or_else(|| AppError::NotFound(format!("{kind} session '{label}'")))?;
        *quota += ram_quota;
        Ok(())
    }

    fn memory(&self) -> Arc<dyn DataspaceAccess> {
        Arc::new(SimMemory {
            state: Arc::clone(&self.state),
        })
    }

    fn supervisor_ram(&self) -> Arc<dyn RamService> {
        Arc::clone(&self.supervisor_ram) as Arc<dyn RamService>
    }
}

// ── Memory ──────────────────────────────────────────────

struct SimRam {
    badge: Badge,
    state: Arc<SimState>,
    quota: AtomicUsize,
    owned: Mutex<BTreeMap<Badge, usize>>,
}

impl SimRam {
    fn new(state: Arc<SimState>, quota: usize) -> Self {
        Self {
            badge: state.badge(),
            state,
            quota: AtomicUsize::new(quota),
            owned: Mutex::new(BTreeMap::new()),
        }
    }
}

impl KernelObject for SimRam {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl RamService for SimRam {
    fn alloc(&self, size: usize, _cache: CacheAttr) -> Result<Badge> {
        let size = round_page(size.max(1));
        let mut owned = lock(&self.owned);
        let used: usize = owned.values().sum();
        let quota = self.quota.load(Ordering::SeqCst);
        if used + size > quota {
            return Err(AppError::ResourceExhausted(format!(
                "ram quota exceeded ({used} + {size} > {quota})"
            )));
        }
        let ds = self.state.create_dataspace(vec![0; size]);
        owned.insert(ds, size);
        debug!(%ds, size, "sim: dataspace allocated");
        Ok(ds)
    }

    fn free(&self, ds: Badge) -> Result<()> {
        if lock(&self.owned).remove(&ds).is_none() {
            return Err(AppError::Kernel(format!(
                "dataspace {ds} not owned by RAM session {}",
                self.badge
            )));
        }
        lock(&self.state.dataspaces).remove(&ds);
        Ok(())
    }

    fn quota(&self) -> usize {
        self.quota.load(Ordering::SeqCst)
    }

    fn used(&self) -> usize {
        lock(&self.owned).values().sum()
    }
}

struct SimMemory {
    state: Arc<SimState>,
}

impl DataspaceAccess for SimMemory {
    fn attach(&self, ds: Badge) -> Result<Box<dyn Mapping>> {
        let content = lock(&self.state.dataspaces)
            .get(&ds)
            .cloned()
            .ok_or_else(|| AppError::Kernel(format!("cannot attach dataspace {ds}")))?;
        self.state.active_mappings.fetch_add(1, Ordering::SeqCst);
        self.state.total_attaches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimMapping {
            ds,
            content,
            state: Arc::clone(&self.state),
        }))
    }

    fn size(&self, ds: Badge) -> Result<usize> {
        self.state.dataspace_size(ds)
    }
}

struct SimMapping {
    ds: Badge,
    content: Arc<Mutex<Vec<u8>>>,
    state: Arc<SimState>,
}

impl SimMapping {
    fn check_range(&self, offset: usize, len: usize, size: usize) -> Result<()> {
        if offset.checked_add(len).is_some_and(|end| end <= size) {
            Ok(())
        } else {
            Err(AppError::Kernel(format!(
                "access {offset:#x}+{len:#x} outside dataspace {} of {size:#x} bytes",
                self.ds
            )))
        }
    }
}

impl Mapping for SimMapping {
    fn dataspace(&self) -> Badge {
        self.ds
    }

    fn size(&self) -> usize {
        lock(&self.content).len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let content = lock(&self.content);
        self.check_range(offset, buf.len(), content.len())?;
        buf.copy_from_slice(&content[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut content = lock(&self.content);
        self.check_range(offset, data.len(), content.len())?;
        content[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for SimMapping {
    fn drop(&mut self) {
        self.state.active_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Region maps ─────────────────────────────────────────

struct SimRegionMap {
    badge: Badge,
    dataspace: Badge,
    size: usize,
    state: Arc<SimState>,
    regions: Mutex<BTreeMap<Address, usize>>,
    fault_handler: Mutex<Option<Badge>>,
}

impl SimRegionMap {
    fn new(state: Arc<SimState>, size: usize) -> Self {
        Self {
            badge: state.badge(),
            dataspace: state.create_managed(size),
            size,
            state,
            regions: Mutex::new(BTreeMap::new()),
            fault_handler: Mutex::new(None),
        }
    }

    fn overlaps(regions: &BTreeMap<Address, usize>, start: Address, len: usize) -> bool {
        let end = start + len as u64;
        regions
            .iter()
            .any(|(&addr, &size)| addr < end && start < addr + size as u64)
    }

    fn first_fit(regions: &BTreeMap<Address, usize>, len: usize, limit: usize) -> Option<Address> {
        let mut candidate: Address = 0;
        for (&addr, &size) in regions {
            if candidate + len as u64 <= addr {
                break;
            }
            candidate = candidate.max(addr + size as u64);
        }
        (candidate + len as u64 <= limit as u64).then_some(candidate)
    }
}

impl KernelObject for SimRegionMap {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl RegionMapService for SimRegionMap {
    fn dataspace(&self) -> Badge {
        self.dataspace
    }

    fn size(&self) -> usize {
        self.size
    }

    fn attach(&self, ds: Badge, request: AttachRequest) -> Result<Address> {
        let ds_size = self.state.dataspace_size(ds)?;
        if request.offset >= ds_size {
            return Err(AppError::Kernel(format!(
                "offset {:#x} outside dataspace {ds}",
                request.offset
            )));
        }
        let len = if request.size == 0 {
            ds_size - request.offset
        } else {
            request.size
        };
        if request.offset + len > ds_size {
            return Err(AppError::Kernel(format!("attach range exceeds dataspace {ds}")));
        }
        let len = round_page(len);

        let mut regions = lock(&self.regions);
        let addr = if request.use_local_addr {
            let fits = request.local_addr + len as u64 <= self.size as u64;
            if !fits || Self::overlaps(&regions, request.local_addr, len) {
                return Err(AppError::Kernel(format!(
                    "region conflict at {:#x} in region map {}",
                    request.local_addr, self.badge
                )));
            }
            request.local_addr
        } else {
            Self::first_fit(&regions, len, self.size)
                .ok_or_else(|| AppError::Kernel(format!("region map {} is full", self.badge)))?
        };
        regions.insert(addr, len);
        Ok(addr)
    }

    fn detach(&self, addr: Address) -> Result<()> {
        lock(&self.regions)
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| AppError::Kernel(format!("no region at {addr:#x}")))
    }

    fn fault_handler(&self, sigh: Badge) -> Result<()> {
        *lock(&self.fault_handler) = Some(sigh);
        Ok(())
    }
}

struct SimRm {
    badge: Badge,
    state: Arc<SimState>,
    maps: Mutex<BTreeMap<Badge, Arc<SimRegionMap>>>,
}

impl KernelObject for SimRm {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl RmService for SimRm {
    fn create(&self, size: usize) -> Result<Arc<dyn RegionMapService>> {
        let map = Arc::new(SimRegionMap::new(Arc::clone(&self.state), round_page(size)));
        lock(&self.maps).insert(map.badge, Arc::clone(&map));
        Ok(map)
    }

    fn destroy(&self, region_map: Badge) -> Result<()> {
        let map = lock(&self.maps)
            .remove(&region_map)
            .ok_or_else(|| AppError::Kernel(format!("unknown region map {region_map}")))?;
        lock(&self.state.managed).remove(&map.dataspace);
        Ok(())
    }
}

// ── Protection domain ───────────────────────────────────

struct SimPd {
    badge: Badge,
    state: Arc<SimState>,
    address_space: Arc<SimRegionMap>,
    stack_area: Arc<SimRegionMap>,
    linker_area: Arc<SimRegionMap>,
    sources: Mutex<BTreeSet<Badge>>,
    contexts: Mutex<BTreeMap<Badge, u64>>,
    rpc_caps: Mutex<BTreeSet<Badge>>,
}

impl SimPd {
    fn new(state: Arc<SimState>) -> Self {
        Self {
            badge: state.badge(),
            address_space: Arc::new(SimRegionMap::new(Arc::clone(&state), ADDRESS_SPACE_SIZE)),
            stack_area: Arc::new(SimRegionMap::new(Arc::clone(&state), AREA_SIZE)),
            linker_area: Arc::new(SimRegionMap::new(Arc::clone(&state), AREA_SIZE)),
            state,
            sources: Mutex::new(BTreeSet::new()),
            contexts: Mutex::new(BTreeMap::new()),
            rpc_caps: Mutex::new(BTreeSet::new()),
        }
    }
}

impl KernelObject for SimPd {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl PdService for SimPd {
    fn address_space(&self) -> Arc<dyn RegionMapService> {
        Arc::clone(&self.address_space) as Arc<dyn RegionMapService>
    }

    fn stack_area(&self) -> Arc<dyn RegionMapService> {
        Arc::clone(&self.stack_area) as Arc<dyn RegionMapService>
    }

    fn linker_area(&self) -> Arc<dyn RegionMapService> {
        Arc::clone(&self.linker_area) as Arc<dyn RegionMapService>
    }

    fn alloc_signal_source(&self) -> Result<Badge> {
        let source = self.state.badge();
        lock(&self.sources).insert(source);
        Ok(source)
    }

    fn free_signal_source(&self, source: Badge) -> Result<()> {
        if lock(&self.sources).remove(&source) {
            Ok(())
        } else {
            Err(AppError::Kernel(format!("unknown signal source {source}")))
        }
    }

    fn alloc_context(&self, source: Badge, _imprint: u64) -> Result<Badge> {
        if !lock(&self.sources).contains(&source) {
            return Err(AppError::Kernel(format!("unknown signal source {source}")));
        }
        let context = self.state.badge();
        lock(&self.contexts).insert(context, 0);
        Ok(context)
    }

    fn free_context(&self, context: Badge) -> Result<()> {
        lock(&self.contexts)
            .remove(&context)
            .map(|_| ())
            .ok_or_else(|| AppError::Kernel(format!("unknown signal context {context}")))
    }

    fn submit(&self, context: Badge, count: u32) -> Result<()> {
        let mut contexts = lock(&self.contexts);
        let pending = contexts
            .get_mut(&context)
            .ok_or_else(|| AppError::Kernel(format!("unknown signal context {context}")))?;
        *pending += u64::from(count);
        Ok(())
    }

    fn alloc_rpc_cap(&self, _entrypoint: Badge) -> Result<Badge> {
        let cap = self.state.badge();
        lock(&self.rpc_caps).insert(cap);
        Ok(cap)
    }

    fn free_rpc_cap(&self, cap: Badge) -> Result<()> {
        if lock(&self.rpc_caps).remove(&cap) {
            Ok(())
        } else {
            Err(AppError::Kernel(format!("unknown rpc capability {cap}")))
        }
    }
}

// ── Threads ─────────────────────────────────────────────

#[derive(Default)]
struct SimThreadState {
    regs: ThreadState,
    started: bool,
    paused: bool,
    single_step: bool,
    affinity: Affinity,
    pause_calls: u64,
}

struct SimThread {
    badge: Badge,
    inner: Mutex<SimThreadState>,
}

impl KernelObject for SimThread {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl CpuThreadService for SimThread {
    fn start(&self, ip: Address, sp: Address) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.started {
            return Err(AppError::Kernel(format!("thread {} already started", self.badge)));
        }
        inner.started = true;
        inner.regs.ip = ip;
        inner.regs.sp = sp;
        inner.regs.r[0] = self.badge.raw();
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.paused = true;
        inner.pause_calls += 1;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        lock(&self.inner).paused = false;
        Ok(())
    }

    fn state(&self) -> Result<ThreadState> {
        Ok(lock(&self.inner).regs)
    }

    fn set_state(&self, state: ThreadState) -> Result<()> {
        lock(&self.inner).regs = state;
        Ok(())
    }

    fn single_step(&self, enabled: bool) -> Result<()> {
        lock(&self.inner).single_step = enabled;
        Ok(())
    }

    fn affinity(&self, location: Affinity) -> Result<()> {
        if location.xpos >= AFFINITY_WIDTH || location.ypos > 0 {
            return Err(AppError::Kernel(format!(
                "affinity ({}, {}) outside affinity space",
                location.xpos, location.ypos
            )));
        }
        lock(&self.inner).affinity = location;
        Ok(())
    }

    fn exception_sigh(&self, _sigh: Badge) -> Result<()> {
        Ok(())
    }
}

struct SimCpu {
    badge: Badge,
    state: Arc<SimState>,
    threads: Mutex<BTreeMap<Badge, Arc<SimThread>>>,
    exception_sigh: Mutex<Option<Badge>>,
}

impl KernelObject for SimCpu {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl CpuService for SimCpu {
    fn create_thread(
        &self,
        _pd: Badge,
        _name: &str,
        affinity: Affinity,
        _weight: u32,
        _utcb: Address,
    ) -> Result<Arc<dyn CpuThreadService>> {
        let thread = Arc::new(SimThread {
            badge: self.state.badge(),
            inner: Mutex::new(SimThreadState {
                affinity,
                ..SimThreadState::default()
            }),
        });
        lock(&self.threads).insert(thread.badge, Arc::clone(&thread));
        lock(&self.state.threads).insert(thread.badge, Arc::clone(&thread));
        Ok(thread)
    }

    fn kill_thread(&self, thread: Badge) -> Result<()> {
        lock(&self.state.threads).remove(&thread);
        lock(&self.threads)
            .remove(&thread)
            .map(|_| ())
            .ok_or_else(|| AppError::Kernel(format!("unknown thread {thread}")))
    }

    fn exception_sigh(&self, sigh: Badge) -> Result<()> {
        *lock(&self.exception_sigh) = Some(sigh);
        Ok(())
    }
}

// ── Simple services ─────────────────────────────────────

struct SimRom {
    badge: Badge,
    dataspace: Badge,
    sigh: Mutex<Option<Badge>>,
}

impl KernelObject for SimRom {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl RomService for SimRom {
    fn dataspace(&self) -> Result<Badge> {
        Ok(self.dataspace)
    }

    fn update(&self) -> bool {
        false
    }

    fn sigh(&self, sigh: Badge) -> Result<()> {
        *lock(&self.sigh) = Some(sigh);
        Ok(())
    }
}

struct SimLog {
    badge: Badge,
    label: String,
}

impl KernelObject for SimLog {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl LogService for SimLog {
    fn write(&self, line: &str) -> Result<usize> {
        debug!(label = %self.label, "{line}");
        Ok(line.len())
    }
}

struct SimTimer {
    badge: Badge,
    opened: Instant,
    sigh: Mutex<Option<Badge>>,
}

impl KernelObject for SimTimer {
    fn badge(&self) -> Badge {
        self.badge
    }
}

impl TimerService for SimTimer {
    fn trigger_once(&self, _us: u64) -> Result<()> {
        if lock(&self.sigh).is_none() {
            return Err(AppError::Kernel("timeout requested without handler".into()));
        }
        Ok(())
    }

    fn trigger_periodic(&self, us: u64) -> Result<()> {
        self.trigger_once(us)
    }

    fn sigh(&self, sigh: Badge) -> Result<()> {
        *lock(&self.sigh) = Some(sigh);
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
