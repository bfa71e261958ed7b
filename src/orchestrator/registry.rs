//! Registry of children and their intercepted sessions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use super::cap_mapper::{CapabilityMapper, KcapTable};
use super::worker::CheckpointWorker;
use crate::kernel::{DataspaceAccess, RamService};
use crate::models::report::ChildSnapshot;
use crate::models::session::SessionKind;
use crate::session::context::ChildContext;
use crate::session::cpu::CpuSession;
use crate::session::log::LogSession;
use crate::session::pd::PdSession;
use crate::session::ram::RamSession;
use crate::session::rm::RmSession;
use crate::session::rom::RomSession;
use crate::session::timer::TimerSession;
use crate::session::{lock, ProxySession};

/// A proxy plus the worker that checkpoints it.
pub struct SessionHandle<T> {
    /// The proxy.
    pub session: Arc<T>,
    /// Its checkpoint worker.
    pub worker: CheckpointWorker,
}

impl<T> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            worker: self.worker.clone(),
        }
    }
}

/// The sessions currently serving one child.
#[derive(Default)]
pub struct ChildSessions {
    /// PD session.
    pub pd: Option<SessionHandle<PdSession>>,
    /// RAM session.
    pub ram: Option<SessionHandle<RamSession>>,
    /// CPU session.
    pub cpu: Option<SessionHandle<CpuSession>>,
    /// RM session.
    pub rm: Option<SessionHandle<RmSession>>,
    /// ROM session.
    pub rom: Option<SessionHandle<RomSession>>,
    /// LOG session.
    pub log: Option<SessionHandle<LogSession>>,
    /// Timer session.
    pub timer: Option<SessionHandle<TimerSession>>,
    /// Capability mapper, present while the PD session is.
    pub cap_mapper: Option<SessionHandle<CapabilityMapper>>,
}

impl ChildSessions {
    /// Whether a session of `kind` is installed.
    #[must_use]
    pub fn has(&self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Pd => self.pd.is_some(),
            SessionKind::Ram => self.ram.is_some(),
            SessionKind::Rm => self.rm.is_some(),
            SessionKind::Cpu => self.cpu.is_some(),
            SessionKind::Rom => self.rom.is_some(),
            SessionKind::Log => self.log.is_some(),
            SessionKind::Timer => self.timer.is_some(),
        }
    }

    /// Install a proxy with its worker.
    pub fn install(&mut self, session: ProxySession, worker: CheckpointWorker) {
        match session {
            ProxySession::Pd(session) => self.pd = Some(SessionHandle { session, worker }),
            ProxySession::Ram(session) => self.ram = Some(SessionHandle { session, worker }),
            ProxySession::Rm(session) => self.rm = Some(SessionHandle { session, worker }),
            ProxySession::Cpu(session) => self.cpu = Some(SessionHandle { session, worker }),
            ProxySession::Rom(session) => self.rom = Some(SessionHandle { session, worker }),
            ProxySession::Log(session) => self.log = Some(SessionHandle { session, worker }),
            ProxySession::Timer(session) => self.timer = Some(SessionHandle { session, worker }),
        }
    }

    /// Remove the session of `kind` and return it with its worker.
    pub fn take(&mut self, kind: SessionKind) -> Option<(ProxySession, CheckpointWorker)> {
        match kind {
            SessionKind::Pd => self.pd.take().map(|h| (ProxySession::Pd(h.session), h.worker)),
            SessionKind::Ram => self.ram.take().map(|h| (ProxySession::Ram(h.session), h.worker)),
            SessionKind::Rm => self.rm.take().map(|h| (ProxySession::Rm(h.session), h.worker)),
            SessionKind::Cpu => self.cpu.take().map(|h| (ProxySession::Cpu(h.session), h.worker)),
            SessionKind::Rom => self.rom.take().map(|h| (ProxySession::Rom(h.session), h.worker)),
            SessionKind::Log => self.log.take().map(|h| (ProxySession::Log(h.session), h.worker)),
            SessionKind::Timer => self
                .timer
                .take()
                .map(|h| (ProxySession::Timer(h.session), h.worker)),
        }
    }

    /// The installed session of `kind`.
    #[must_use]
    pub fn get(&self, kind: SessionKind) -> Option<ProxySession> {
        match kind {
            SessionKind::Pd => self.pd.as_ref().map(|h| ProxySession::Pd(Arc::clone(&h.session))),
            SessionKind::Ram => self.ram.as_ref().map(|h| ProxySession::Ram(Arc::clone(&h.session))),
            SessionKind::Rm => self.rm.as_ref().map(|h| ProxySession::Rm(Arc::clone(&h.session))),
            SessionKind::Cpu => self.cpu.as_ref().map(|h| ProxySession::Cpu(Arc::clone(&h.session))),
            SessionKind::Rom => self.rom.as_ref().map(|h| ProxySession::Rom(Arc::clone(&h.session))),
            SessionKind::Log => self.log.as_ref().map(|h| ProxySession::Log(Arc::clone(&h.session))),
            SessionKind::Timer => self
                .timer
                .as_ref()
                .map(|h| ProxySession::Timer(Arc::clone(&h.session))),
        }
    }

    /// Every installed session in sequential checkpoint order.
    #[must_use]
    pub fn sessions(&self) -> Vec<ProxySession> {
        SessionKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind))
            .collect()
    }

    /// Workers in sequential checkpoint order, capability mapper last.
    #[must_use]
    pub fn workers(&self) -> Vec<CheckpointWorker> {
        let mut workers: Vec<CheckpointWorker> = [
            self.pd.as_ref().map(|h| &h.worker),
            self.ram.as_ref().map(|h| &h.worker),
            self.cpu.as_ref().map(|h| &h.worker),
            self.rm.as_ref().map(|h| &h.worker),
            self.rom.as_ref().map(|h| &h.worker),
            self.log.as_ref().map(|h| &h.worker),
            self.timer.as_ref().map(|h| &h.worker),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        if let Some(mapper) = &self.cap_mapper {
            workers.push(mapper.worker.clone());
        }
        workers
    }
}

/// Registry entry of one child.
pub struct ChildInfo {
    context: Arc<ChildContext>,
    sessions: Mutex<ChildSessions>,
}

impl ChildInfo {
    fn new(context: ChildContext) -> Self {
        Self {
            context: Arc::new(context),
            sessions: Mutex::new(ChildSessions::default()),
        }
    }

    /// Child name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// State shared by the child's sessions.
    #[must_use]
    pub fn context(&self) -> &Arc<ChildContext> {
        &self.context
    }

    /// Lock the child's session table.
    pub fn sessions(&self) -> MutexGuard<'_, ChildSessions> {
        lock(&self.sessions)
    }

    /// PD proxy.
    #[must_use]
    pub fn pd(&self) -> Option<Arc<PdSession>> {
        self.sessions().pd.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// RAM proxy.
    #[must_use]
    pub fn ram(&self) -> Option<Arc<RamSession>> {
        self.sessions().ram.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// CPU proxy.
    #[must_use]
    pub fn cpu(&self) -> Option<Arc<CpuSession>> {
        self.sessions().cpu.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// RM proxy.
    #[must_use]
    pub fn rm(&self) -> Option<Arc<RmSession>> {
        self.sessions().rm.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// ROM proxy.
    #[must_use]
    pub fn rom(&self) -> Option<Arc<RomSession>> {
        self.sessions().rom.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// LOG proxy.
    #[must_use]
    pub fn log(&self) -> Option<Arc<LogSession>> {
        self.sessions().log.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// Timer proxy.
    #[must_use]
    pub fn timer(&self) -> Option<Arc<TimerSession>> {
        self.sessions().timer.as_ref().map(|h| Arc::clone(&h.session))
    }

    /// Capability mapper.
    #[must_use]
    pub fn cap_mapper(&self) -> Option<Arc<CapabilityMapper>> {
        self.sessions()
            .cap_mapper
            .as_ref()
            .map(|h| Arc::clone(&h.session))
    }

    /// Whether the child is torn down: neither PD nor CPU session remains.
    #[must_use]
    pub fn child_destroyed(&self) -> bool {
        let sessions = self.sessions();
        sessions.pd.is_none() && sessions.cpu.is_none()
    }

    /// Workers in sequential checkpoint order.
    #[must_use]
    pub fn workers(&self) -> Vec<CheckpointWorker> {
        self.sessions().workers()
    }

    /// Kcap table of the last mapper run; empty without a mapper.
    #[must_use]
    pub fn kcap_table(&self) -> KcapTable {
        self.cap_mapper()
            .map(|mapper| mapper.table())
            .unwrap_or_default()
    }

    /// Annotate every session's snapshot with `kcaps`.
    pub fn annotate(&self, kcaps: &KcapTable) {
        for session in self.sessions().sessions() {
            session.checkpointable().annotate(kcaps);
        }
    }

    /// Everything the last checkpoint captured for this child.
    #[must_use]
    pub fn snapshot(&self) -> ChildSnapshot {
        let sessions = self.sessions();
        let mut snapshot = ChildSnapshot {
            child: self.name().to_owned(),
            sessions: sessions
                .sessions()
                .iter()
                .filter_map(|s| s.info().snapshot())
                .collect(),
            translations: self.context.translations().list(),
            ..ChildSnapshot::default()
        };
        if let Some(pd) = &sessions.pd {
            let pd = &pd.session;
            snapshot.region_maps = pd.region_map_snapshots();
            snapshot.signal_sources = pd.signal_sources().snapshot();
            snapshot.signal_contexts = pd.signal_contexts().snapshot();
            snapshot.native_caps = pd.native_caps().snapshot();
        }
        if let Some(ram) = &sessions.ram {
            snapshot.ram_dataspaces = ram.session.dataspaces().snapshot();
        }
        if let Some(cpu) = &sessions.cpu {
            snapshot.threads = cpu.session.threads().snapshot();
        }
        if let Some(rm) = &sessions.rm {
            snapshot.rm_region_maps = rm.session.region_maps().snapshot();
            snapshot
                .region_maps
                .extend(rm.session.region_map_snapshots());
        }
        if let Some(rom) = &sessions.rom {
            snapshot.rom = rom.session.state().snapshot();
        }
        if let Some(timer) = &sessions.timer {
            snapshot.timer = timer.session.state().snapshot();
        }
        snapshot
    }
}

/// All known children, keyed by name.
pub struct ChildRegistry {
    memory: Arc<dyn DataspaceAccess>,
    supervisor_ram: Arc<dyn RamService>,
    children: Mutex<BTreeMap<String, Arc<ChildInfo>>>,
}

impl ChildRegistry {
    /// Create an empty registry.
    ///
    /// New children get contexts backed by `memory` and `supervisor_ram`.
    #[must_use]
    pub fn new(memory: Arc<dyn DataspaceAccess>, supervisor_ram: Arc<dyn RamService>) -> Self {
        Self {
            memory,
            supervisor_ram,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// Find or create the entry of child `name`.
    pub fn child_info(&self, name: &str) -> Arc<ChildInfo> {
        let mut children = lock(&self.children);
        if let Some(child) = children.get(name) {
            return Arc::clone(child);
        }
        let child = Arc::new(ChildInfo::new(ChildContext::new(
            name,
            Arc::clone(&self.memory),
            Arc::clone(&self.supervisor_ram),
        )));
        children.insert(name.to_owned(), Arc::clone(&child));
        info!(child = name, "child registered");
        child
    }

    /// Entry of child `name`, if registered.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<ChildInfo>> {
        lock(&self.children).get(name).cloned()
    }

    /// Every registered child, ordered by name.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<ChildInfo>> {
        lock(&self.children).values().cloned().collect()
    }

    /// Drop the entries of torn-down children and return their names.
    ///
    /// The content copies of a reaped child are freed.
    pub fn reap(&self) -> Vec<String> {
        let mut children = lock(&self.children);
        let gone: Vec<String> = children
            .iter()
            .filter(|(_, child)| child.child_destroyed())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &gone {
            if let Some(child) = children.remove(name) {
                child.context().translations().release_all();
                info!(child = %name, "child reaped");
            }
        }
        gone
    }
}
