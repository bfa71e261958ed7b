//! Session factories, looked up by service name.
//!
//! The registry is an explicit table built once at start-up. Every
//! supported service contributes one [`SessionFactory`].

use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::ChildContext;
use super::cpu::CpuSession;
use super::log::LogSession;
use super::pd::PdSession;
use super::ram::RamSession;
use super::rm::RmSession;
use super::rom::RomSession;
use super::timer::TimerSession;
use super::ProxySession;
use crate::kernel::Kernel;
use crate::models::session::{SessionArgs, SessionKind};
use crate::Result;

/// Opens a real session and wraps it in a proxy.
pub trait SessionFactory: Send + Sync {
    /// Kind of session produced.
    fn kind(&self) -> SessionKind;

    /// Open the real session and wrap it.
    ///
    /// # Errors
    ///
    /// Returns the kernel's error if the real session cannot be opened.
    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession>;
}

struct PdFactory;

impl SessionFactory for PdFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Pd
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_pd(&args.label)?;
        Ok(ProxySession::Pd(Arc::new(PdSession::new(
            real,
            Arc::clone(context),
            args,
        ))))
    }
}

struct RamFactory;

impl SessionFactory for RamFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Ram
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_ram(&args.label, args.ram_quota)?;
        Ok(ProxySession::Ram(Arc::new(RamSession::new(
            real,
            Arc::clone(context),
            args,
        ))))
    }
}

struct RmFactory;

impl SessionFactory for RmFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Rm
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_rm(&args.label)?;
        Ok(ProxySession::Rm(Arc::new(RmSession::new(
            real,
            Arc::clone(context),
            args,
        ))))
    }
}

struct CpuFactory;

impl SessionFactory for CpuFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Cpu
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_cpu(&args.label)?;
        Ok(ProxySession::Cpu(Arc::new(CpuSession::new(
            real,
            Arc::clone(context),
            args,
        ))))
    }
}

struct RomFactory;

impl SessionFactory for RomFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Rom
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_rom(&args.label)?;
        Ok(ProxySession::Rom(Arc::new(RomSession::new(
            real, context, args,
        ))))
    }
}

struct LogFactory;

impl SessionFactory for LogFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Log
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_log(&args.label)?;
        Ok(ProxySession::Log(Arc::new(LogSession::new(
            real, context, args,
        ))))
    }
}

struct TimerFactory;

impl SessionFactory for TimerFactory {
    fn kind(&self) -> SessionKind {
        SessionKind::Timer
    }

    fn create(
        &self,
        kernel: &dyn Kernel,
        args: &SessionArgs,
        context: &Arc<ChildContext>,
    ) -> Result<ProxySession> {
        let real = kernel.open_timer(&args.label)?;
        Ok(ProxySession::Timer(Arc::new(TimerSession::new(
            real, context, args,
        ))))
    }
}

/// Factories keyed by service name.
#[derive(Default)]
pub struct SessionFactoryRegistry {
    factories: BTreeMap<&'static str, Box<dyn SessionFactory>>,
}

impl SessionFactoryRegistry {
    /// Registry holding a factory for every built-in service.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(PdFactory));
        registry.register(Box::new(RamFactory));
        registry.register(Box::new(RmFactory));
        registry.register(Box::new(CpuFactory));
        registry.register(Box::new(RomFactory));
        registry.register(Box::new(LogFactory));
        registry.register(Box::new(TimerFactory));
        registry
    }

    /// Add or replace the factory for the factory's service name.
    pub fn register(&mut self, factory: Box<dyn SessionFactory>) {
        self.factories.insert(factory.kind().service_name(), factory);
    }

    /// Factory for `service`.
    #[must_use]
    pub fn find(&self, service: &str) -> Option<&dyn SessionFactory> {
        self.factories.get(service).map(AsRef::as_ref)
    }

    /// Names of every registered service.
    #[must_use]
    pub fn services(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}
