//! Session entry point of the supervisor.
//!
//! A child's session request names a service and carries the usual
//! argument string. The supervisor routes it to the child's registry
//! entry by label, opens the real session through the matching factory,
//! and starts the checkpoint worker of the new proxy.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use super::cap_mapper::CapabilityMapper;
use super::registry::{ChildInfo, ChildRegistry, SessionHandle};
use super::worker::{CheckpointWorker, Checkpointable};
use crate::config::{GlobalConfig, CAP_MAPPER_UNIT};
use crate::kernel::Kernel;
use crate::models::session::{SessionArgs, SessionKind};
use crate::session::factory::SessionFactoryRegistry;
use crate::session::ProxySession;
use crate::{AppError, Result};

/// Interposes on every session a child opens.
pub struct Supervisor {
    kernel: Arc<dyn Kernel>,
    registry: Arc<ChildRegistry>,
    factories: SessionFactoryRegistry,
    config: Arc<GlobalConfig>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor forwarding to `kernel`.
    ///
    /// Workers are stopped when `cancel` fires or on [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn new(kernel: Arc<dyn Kernel>, config: Arc<GlobalConfig>, cancel: CancellationToken) -> Self {
        let registry = Arc::new(ChildRegistry::new(kernel.memory(), kernel.supervisor_ram()));
        Self {
            kernel,
            registry,
            factories: SessionFactoryRegistry::with_builtin(),
            config,
            cancel,
        }
    }

    /// Child registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChildRegistry> {
        &self.registry
    }

    /// The kernel sessions are forwarded to.
    #[must_use]
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// Open an intercepted session of `service` for the child named by the
    /// label in `raw_args`.
    ///
    /// Opening a PD session also starts the child's capability mapper.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for malformed arguments, `AppError::NotFound`
    /// for an unknown service, `AppError::InvalidState` if the child already
    /// has a session of that kind, or the kernel's error.
    pub fn open_session(&self, service: &str, raw_args: &str) -> Result<ProxySession> {
        let args = SessionArgs::parse(raw_args)?;
        let factory = self
            .factories
            .find(service)
            .ok_or_else(|| AppError::NotFound(format!("service '{service}'")))?;
        let kind = factory.kind();
        let child = self.registry.child_info(args.child_name());
        let _span = info_span!("open_session", child = child.name(), service).entered();

        if child.sessions().has(kind) {
            return Err(AppError::InvalidState(format!(
                "child '{}' already has a {kind} session",
                child.name()
            )));
        }

        let session = factory.create(self.kernel.as_ref(), &args, child.context())?;
        let worker = self.spawn_worker(kind.unit_name(), &session);
        {
            let mut sessions = child.sessions();
            if let ProxySession::Pd(pd) = &session {
                let mapper = Arc::new(CapabilityMapper::new(
                    Arc::clone(pd),
                    Arc::clone(child.context()),
                    self.config.cap_table.clone(),
                ));
                let mapper_worker = CheckpointWorker::spawn(
                    CAP_MAPPER_UNIT,
                    Arc::clone(&mapper) as Arc<dyn Checkpointable>,
                    self.config.affinity_for(CAP_MAPPER_UNIT),
                    self.cancel.child_token(),
                );
                sessions.cap_mapper = Some(SessionHandle {
                    session: mapper,
                    worker: mapper_worker,
                });
            }
            sessions.install(session.clone(), worker);
        }

        let record = session.info().get();
        info!(badge = %record.badge, label = %record.label, "session opened");
        Ok(session)
    }

    fn spawn_worker(&self, unit: &str, session: &ProxySession) -> CheckpointWorker {
        CheckpointWorker::spawn(
            unit,
            session.checkpointable(),
            self.config.affinity_for(unit),
            self.cancel.child_token(),
        )
    }

    fn child(&self, name: &str) -> Result<Arc<ChildInfo>> {
        self.registry
            .find(name)
            .ok_or_else(|| AppError::NotFound(format!("child '{name}'")))
    }

    /// Donate `ram_quota` more bytes to a child's session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the child or session does not exist,
    /// or the kernel's error.
    pub fn upgrade_session(&self, child: &str, kind: SessionKind, ram_quota: usize) -> Result<()> {
        let session = self
            .child(child)?
            .sessions()
            .get(kind)
            .ok_or_else(|| AppError::NotFound(format!("{kind} session of child '{child}'")))?;
        let label = session.info().get().label;
        self.kernel.upgrade(kind, &label, ram_quota)?;
        session.info().update(|record| record.ram_quota += ram_quota);
        info!(child, %kind, ram_quota, "session upgraded");
        Ok(())
    }

    /// Close a child's session, stop its worker and reap the child once
    /// its PD and CPU sessions are both gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the child or session does not exist,
    /// or the first error reported while releasing the session's objects.
    pub fn close_session(&self, child: &str, kind: SessionKind) -> Result<()> {
        let info = self.child(child)?;
        let (session, worker, mapper) = {
            let mut sessions = info.sessions();
            let (session, worker) = sessions
                .take(kind)
                .ok_or_else(|| AppError::NotFound(format!("{kind} session of child '{child}'")))?;
            let mapper = if kind == SessionKind::Pd {
                sessions.cap_mapper.take()
            } else {
                None
            };
            (session, worker, mapper)
        };

        worker.stop();
        if let Some(mapper) = mapper {
            mapper.worker.stop();
        }
        let closed = session.close();
        if let Err(err) = &closed {
            warn!(child, %kind, %err, "session closed with errors");
        }
        info!(child, %kind, "session closed");

        if info.child_destroyed() {
            self.registry.reap();
        }
        closed
    }

    /// End the child's bootstrap phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the child does not exist.
    pub fn mark_bootstrapped(&self, child: &str) -> Result<()> {
        self.child(child)?.context().mark_bootstrapped();
        info!(child, "child bootstrapped");
        Ok(())
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        info!("stopping all checkpoint workers");
        self.cancel.cancel();
    }
}
