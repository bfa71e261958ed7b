//! Demo children driven against the supervisor.
//!
//! A [`ChildWorkload`] opens the usual set of sessions through the
//! supervisor, lays out its address space the way a dynamically linked
//! component would, fills its capability table and then keeps mutating
//! its memory so successive checkpoints have something to diff.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::{CapTableConfig, ChildConfig};
use crate::kernel::sim::{LINKER_AREA_BASE, STACK_AREA_BASE};
use crate::kernel::{round_page, Address, Affinity, AttachRequest, CacheAttr, DataspaceAccess};
use crate::models::Badge;
use crate::orchestrator::cap_mapper::write_cap_slot;
use crate::orchestrator::supervisor::Supervisor;
use crate::session::cpu::CpuSession;
use crate::session::log::LogSession;
use crate::session::pd::PdSession;
use crate::session::ram::RamSession;
use crate::session::region_map::RegionMap;
use crate::session::rom::RomSession;
use crate::session::{lock, ProxySession};
use crate::{AppError, Result};

const STACK_SIZE: usize = 16 << 10;
const STACK_STRIDE: Address = 0x10_0000;
const ENTRY_POINT: Address = 0x0100_0000;
const SCRATCH_MAP_SIZE: usize = 1 << 20;
const SCRATCH_SIZE: usize = 8 << 10;
const TIMER_PERIOD_US: u64 = 10_000;

/// A running demo child.
pub struct ChildWorkload {
    name: String,
    memory: Arc<dyn DataspaceAccess>,
    layout: CapTableConfig,
    pd: Arc<PdSession>,
    ram: Arc<RamSession>,
    cpu: Arc<CpuSession>,
    log: Arc<LogSession>,
    rom: Option<Arc<RomSession>>,
    scratch_map: Arc<RegionMap>,
    cap_table: Badge,
    next_slot: Mutex<usize>,
    data: Vec<Badge>,
    transient: Mutex<Option<(Badge, Address, usize)>>,
}

impl ChildWorkload {
    /// Open the child's sessions and build its initial state.
    ///
    /// Ends the child's bootstrap phase before returning.
    ///
    /// # Errors
    ///
    /// Returns the supervisor's or kernel's error if any session or
    /// object cannot be created, or `AppError::Config` if the capability
    /// table does not lie inside the linker area.
    #[allow(clippy::cast_possible_truncation, clippy::too_many_lines)]
    pub fn launch(supervisor: &Supervisor, config: &ChildConfig) -> Result<Self> {
        let name = config.name.as_str();
        let _span = tracing::info_span!("launch", child = name).entered();
        let layout = supervisor.config().cap_table.clone();
        let label = format!("label=\"{name}\"");

        let ProxySession::Pd(pd) = supervisor.open_session("PD", &label)? else {
            return Err(unexpected("PD"));
        };
        let ProxySession::Ram(ram) = supervisor
            .open_session("RAM", &format!("{label}, ram_quota={}", config.ram_quota))?
        else {
            return Err(unexpected("RAM"));
        };
        let ProxySession::Cpu(cpu) = supervisor.open_session("CPU", &label)? else {
            return Err(unexpected("CPU"));
        };
        let ProxySession::Rm(rm) = supervisor.open_session("RM", &label)? else {
            return Err(unexpected("RM"));
        };
        let ProxySession::Log(log) = supervisor.open_session("LOG", &label)? else {
            return Err(unexpected("LOG"));
        };
        let ProxySession::Timer(timer) = supervisor.open_session("Timer", &label)? else {
            return Err(unexpected("Timer"));
        };
        let rom = match &config.rom {
            Some(module) => {
                let args = format!("label=\"{name} -> {module}\"");
                let ProxySession::Rom(rom) = supervisor.open_session("ROM", &args)? else {
                    return Err(unexpected("ROM"));
                };
                rom.dataspace()?;
                Some(rom)
            }
            None => None,
        };

        let address_space = pd.address_space();
        address_space.attach(pd.stack_area().dataspace(), AttachRequest::at(STACK_AREA_BASE))?;
        address_space.attach(pd.linker_area().dataspace(), AttachRequest::at(LINKER_AREA_BASE))?;

        let table_offset = layout
            .base_address
            .checked_sub(LINKER_AREA_BASE)
            .filter(|offset| *offset < pd.linker_area().size() as u64)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "capability table at {:#x} lies outside the linker area",
                    layout.base_address
                ))
            })?;
        let cap_table = ram.alloc(round_page(layout.table_size()), CacheAttr::Cached)?;
        pd.linker_area().attach(cap_table, AttachRequest::at(table_offset))?;

        let scratch_map = rm.create(SCRATCH_MAP_SIZE)?;
        address_space.attach(scratch_map.dataspace(), AttachRequest::default())?;

        let mut data = Vec::with_capacity(config.dataspaces.len());
        for (idx, size) in config.dataspaces.iter().enumerate() {
            let ds = ram.alloc(*size, CacheAttr::Cached)?;
            address_space.attach(ds, AttachRequest::default())?;
            fill(supervisor.kernel().memory().as_ref(), ds, *size, idx as u8)?;
            data.push(ds);
        }

        let workload = Self {
            name: name.to_owned(),
            memory: supervisor.kernel().memory(),
            layout,
            pd: Arc::clone(&pd),
            ram: Arc::clone(&ram),
            cpu: Arc::clone(&cpu),
            log: Arc::clone(&log),
            rom,
            scratch_map,
            cap_table,
            next_slot: Mutex::new(1),
            data,
            transient: Mutex::new(None),
        };

        for badge in [pd.badge(), ram.badge(), cpu.badge(), rm.badge(), cap_table] {
            workload.publish_cap(badge)?;
        }
        for ds in &workload.data {
            workload.publish_cap(*ds)?;
        }

        for idx in 0..config.threads {
            let stack = ram.alloc(STACK_SIZE, CacheAttr::Cached)?;
            let stack_offset = idx as Address * STACK_STRIDE;
            pd.stack_area().attach(stack, AttachRequest::at(stack_offset))?;
            let thread = cpu.create_thread(
                pd.badge(),
                &format!("{name}-{idx}"),
                Affinity::default(),
                1,
                STACK_AREA_BASE + stack_offset,
            )?;
            let sp = STACK_AREA_BASE + stack_offset + STACK_SIZE as Address;
            thread.start(ENTRY_POINT, sp)?;
            workload.publish_cap(thread.badge())?;
        }

        let source = pd.alloc_signal_source()?;
        let context = pd.alloc_context(source, 1)?;
        let entrypoint = pd.alloc_rpc_cap(pd.badge())?;
        timer.sigh(context)?;
        timer.trigger_periodic(TIMER_PERIOD_US)?;
        for badge in [source, context, entrypoint] {
            workload.publish_cap(badge)?;
        }
        log.write(&format!("{name}: started with {} thread(s)", config.threads))?;

        supervisor.mark_bootstrapped(name)?;
        info!(threads = config.threads, dataspaces = workload.data.len(), "child launched");
        Ok(workload)
    }

    /// Child name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability-table dataspace.
    #[must_use]
    pub fn cap_table(&self) -> Badge {
        self.cap_table
    }

    /// Dataspaces allocated at launch.
    #[must_use]
    pub fn data(&self) -> &[Badge] {
        &self.data
    }

    /// ROM session, if the child opened one.
    #[must_use]
    pub fn rom(&self) -> Option<&Arc<RomSession>> {
        self.rom.as_ref()
    }

    /// Record `badge` in the next free slot of the capability table.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the table is full, or the mapping's
    /// error.
    pub fn publish_cap(&self, badge: Badge) -> Result<()> {
        let mut next = lock(&self.next_slot);
        self.write_slot(*next, badge)?;
        *next += 1;
        Ok(())
    }

    fn write_slot(&self, slot: usize, badge: Badge) -> Result<()> {
        let mapping = self.memory.attach(self.cap_table)?;
        write_cap_slot(mapping.as_ref(), &self.layout, 0, slot, badge)
    }

    /// Change the child's state the way a running component would.
    ///
    /// Rewrites the launch dataspaces, replaces a scratch dataspace inside
    /// the RM-created region map and writes a log line. The scratch
    /// dataspace keeps one capability-table slot across steps.
    ///
    /// # Errors
    ///
    /// Returns the first error of any forwarded call.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mutate(&self, step: u64) -> Result<()> {
        for (idx, ds) in self.data.iter().enumerate() {
            let size = self.memory.size(*ds)?;
            fill(self.memory.as_ref(), *ds, size, (step as u8).wrapping_add(idx as u8))?;
        }

        let mut transient = lock(&self.transient);
        let slot = match transient.take() {
            Some((ds, address, slot)) => {
                self.scratch_map.detach(address)?;
                self.ram.free(ds)?;
                slot
            }
            None => {
                let mut next = lock(&self.next_slot);
                *next += 1;
                *next - 1
            }
        };
        let ds = self.ram.alloc(SCRATCH_SIZE, CacheAttr::Cached)?;
        let address = self.scratch_map.attach(ds, AttachRequest::default())?;
        fill(self.memory.as_ref(), ds, SCRATCH_SIZE, step as u8)?;
        self.write_slot(slot, ds)?;
        *transient = Some((ds, address, slot));
        drop(transient);

        self.log.write(&format!("{}: step {step}", self.name))?;
        debug!(child = %self.name, step, threads = self.cpu.threads().len(), "child mutated");
        Ok(())
    }

    /// Address-space view of the child.
    #[must_use]
    pub fn pd(&self) -> &Arc<PdSession> {
        &self.pd
    }
}

fn unexpected(service: &str) -> AppError {
    AppError::InvalidState(format!("{service} request produced a different session kind"))
}

#[allow(clippy::cast_possible_truncation)]
fn fill(memory: &dyn DataspaceAccess, ds: Badge, size: usize, seed: u8) -> Result<()> {
    let pattern: Vec<u8> = (0..size).map(|i| seed.wrapping_add(i as u8)).collect();
    memory.attach(ds)?.write(0, &pattern)
}
