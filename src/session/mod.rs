//! Intercepting proxy sessions.
//!
//! Each proxy forwards every call to the real kernel session and records
//! the kernel objects the call creates or destroys. The recorded state is
//! merged into a snapshot by the session's checkpoint step.

pub mod context;
pub mod cpu;
pub mod cpu_thread;
pub mod factory;
pub mod log;
pub mod pd;
pub mod ram;
pub mod region_map;
pub mod rm;
pub mod rom;
pub mod timer;
pub mod tracked;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::records::SessionRecord;
use crate::models::session::{SessionArgs, SessionKind};
use crate::models::Badge;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

use self::context::ChildContext;
use self::tracked::TrackedValue;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Bookkeeping tables are consistent between statements, so the data of a
/// poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session bookkeeping for a freshly opened session.
pub(crate) fn session_info(
    badge: Badge,
    args: &SessionArgs,
    context: &ChildContext,
) -> TrackedValue<SessionRecord> {
    TrackedValue::new(SessionRecord {
        badge,
        label: args.label.clone(),
        bootstrapped: context.bootstrapping(),
        ram_quota: args.ram_quota,
    })
}

/// A proxy session of any kind.
#[derive(Clone)]
pub enum ProxySession {
    /// Protection domain.
    Pd(Arc<pd::PdSession>),
    /// Memory allocation.
    Ram(Arc<ram::RamSession>),
    /// Region-map creation.
    Rm(Arc<rm::RmSession>),
    /// Threads.
    Cpu(Arc<cpu::CpuSession>),
    /// Read-only modules.
    Rom(Arc<rom::RomSession>),
    /// Log output.
    Log(Arc<log::LogSession>),
    /// Timeouts.
    Timer(Arc<timer::TimerSession>),
}

impl fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.info().get();
        f.debug_struct("ProxySession")
            .field("kind", &self.kind())
            .field("badge", &record.badge)
            .field("label", &record.label)
            .finish()
    }
}

impl ProxySession {
    /// Kind of the session.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Pd(_) => SessionKind::Pd,
            Self::Ram(_) => SessionKind::Ram,
            Self::Rm(_) => SessionKind::Rm,
            Self::Cpu(_) => SessionKind::Cpu,
            Self::Rom(_) => SessionKind::Rom,
            Self::Log(_) => SessionKind::Log,
            Self::Timer(_) => SessionKind::Timer,
        }
    }

    /// Generic session bookkeeping.
    #[must_use]
    pub fn info(&self) -> &TrackedValue<SessionRecord> {
        match self {
            Self::Pd(s) => s.info(),
            Self::Ram(s) => s.info(),
            Self::Rm(s) => s.info(),
            Self::Cpu(s) => s.info(),
            Self::Rom(s) => s.info(),
            Self::Log(s) => s.info(),
            Self::Timer(s) => s.info(),
        }
    }

    /// The session as a checkpoint unit.
    #[must_use]
    pub fn checkpointable(&self) -> Arc<dyn Checkpointable> {
        match self {
            Self::Pd(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Ram(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Rm(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Cpu(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Rom(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Log(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
            Self::Timer(s) => Arc::clone(s) as Arc<dyn Checkpointable>,
        }
    }

    /// Release everything the session still holds at the real kernel.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the real session.
    pub fn close(&self) -> Result<()> {
        match self {
            Self::Pd(s) => {
                s.close();
                Ok(())
            }
            Self::Ram(s) => s.close(),
            Self::Rm(s) => s.close(),
            Self::Cpu(s) => s.close(),
            Self::Rom(_) | Self::Log(_) | Self::Timer(_) => Ok(()),
        }
    }
}
