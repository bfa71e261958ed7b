//! LOG session proxy. Carries nothing beyond the session bookkeeping.

use std::sync::Arc;

use super::context::ChildContext;
use super::session_info;
use super::tracked::TrackedValue;
use crate::kernel::LogService;
use crate::models::records::SessionRecord;
use crate::models::session::SessionArgs;
use crate::orchestrator::cap_mapper::KcapTable;
use crate::orchestrator::worker::Checkpointable;
use crate::Result;

/// Intercepts a child's log output.
pub struct LogSession {
    real: Arc<dyn LogService>,
    info: TrackedValue<SessionRecord>,
}

impl LogSession {
    /// Wrap a real LOG session.
    #[must_use]
    pub fn new(real: Arc<dyn LogService>, context: &ChildContext, args: &SessionArgs) -> Self {
        Self {
            info: session_info(real.badge(), args, context),
            real,
        }
    }

    /// Session bookkeeping.
    #[must_use]
    pub fn info(&self) -> &TrackedValue<SessionRecord> {
        &self.info
    }

    /// Write a line.
    ///
    /// # Errors
    ///
    /// Returns the real session's error unchanged.
    pub fn write(&self, line: &str) -> Result<usize> {
        self.real.write(line)
    }
}

impl Checkpointable for LogSession {
    fn checkpoint(&self) -> Result<()> {
        self.info.checkpoint();
        Ok(())
    }

    fn annotate(&self, kcaps: &KcapTable) {
        self.info.annotate(|r| kcaps.find_kcap_by_badge(r.badge));
    }
}
