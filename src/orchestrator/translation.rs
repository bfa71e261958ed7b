//! Dataspace translation: supervisor-owned copies of child memory.
//!
//! One backing dataspace exists per distinct child dataspace. Every
//! checkpoint pass runs in a numbered epoch, and a source dataspace is
//! copied at most once per epoch no matter how many regions or sessions
//! reference it. A caller that finds a copy of the same source still in
//! flight waits for it and retries if it failed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::kernel::{CacheAttr, DataspaceAccess, RamService};
use crate::models::translation::DataspaceTranslation;
use crate::models::Badge;
use crate::session::lock;
use crate::Result;

#[derive(Default)]
struct TranslationState {
    epoch: u64,
    entries: BTreeMap<Badge, DataspaceTranslation>,
    copying: BTreeSet<Badge>,
}

/// The translation table of one child.
pub struct DataspaceTranslations {
    child: String,
    ram: Arc<dyn RamService>,
    memory: Arc<dyn DataspaceAccess>,
    state: Mutex<TranslationState>,
    copied: Condvar,
}

impl DataspaceTranslations {
    /// Create an empty table whose backing dataspaces come from `ram`.
    #[must_use]
    pub fn new(child: String, ram: Arc<dyn RamService>, memory: Arc<dyn DataspaceAccess>) -> Self {
        Self {
            child,
            ram,
            memory,
            state: Mutex::new(TranslationState::default()),
            copied: Condvar::new(),
        }
    }

    /// Start checkpoint epoch `epoch`.
    pub fn begin_epoch(&self, epoch: u64) {
        lock(&self.state).epoch = epoch;
    }

    /// Current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        lock(&self.state).epoch
    }

    /// Make sure `source` has been copied in the current epoch and return
    /// its backing dataspace.
    ///
    /// The backing dataspace is allocated on first use and kept for later
    /// epochs. A failed copy leaves the entry as it was before the call.
    /// Blocks while another caller copies the same source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` if the backing dataspace cannot
    /// be allocated, or `AppError::Kernel` if either dataspace cannot be
    /// attached or accessed.
    pub fn ensure_copied(&self, source: Badge, size: usize) -> Result<Badge> {
        let (backing, epoch, previous) = {
            let mut state = lock(&self.state);
            while state.copying.contains(&source) {
                state = self
                    .copied
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let epoch = state.epoch;
            let claimed = if let Some(entry) = state.entries.get_mut(&source) {
                if entry.copied_epoch == Some(epoch) {
                    return Ok(entry.backing);
                }
                let previous = entry.copied_epoch.replace(epoch);
                (entry.backing, epoch, previous)
            } else {
                let backing = self.ram.alloc(size, CacheAttr::Cached)?;
                let mut entry = DataspaceTranslation::new(source, backing, size);
                entry.copied_epoch = Some(epoch);
                state.entries.insert(source, entry);
                debug!(child = %self.child, %source, %backing, size, "backing dataspace allocated");
                (backing, epoch, None)
            };
            state.copying.insert(source);
            claimed
        };

        let copied = self.copy(source, backing, size);
        let mut state = lock(&self.state);
        state.copying.remove(&source);
        let result = match copied {
            Ok(digest) => {
                if let Some(entry) = state.entries.get_mut(&source) {
                    entry.copies += 1;
                    entry.digest = Some(digest);
                }
                debug!(child = %self.child, %source, epoch, "dataspace copied");
                Ok(backing)
            }
            Err(err) => {
                if let Some(entry) = state.entries.get_mut(&source) {
                    entry.copied_epoch = previous;
                }
                Err(err)
            }
        };
        drop(state);
        self.copied.notify_all();
        result
    }

    fn copy(&self, source: Badge, backing: Badge, size: usize) -> Result<String> {
        let src = self.memory.attach(source)?;
        let dst = self.memory.attach(backing)?;
        let len = size.min(src.size()).min(dst.size());
        let mut buf = vec![0; len];
        src.read(0, &mut buf)?;
        dst.write(0, &buf)?;
        Ok(sha256_hex(&buf))
    }

    /// Drop the translation of `source` and free its backing dataspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the backing dataspace cannot be freed.
    pub fn release(&self, source: Badge) -> Result<()> {
        let entry = lock(&self.state).entries.remove(&source);
        match entry {
            Some(entry) => {
                debug!(child = %self.child, %source, backing = %entry.backing, "backing dataspace released");
                self.ram.free(entry.backing)
            }
            None => Ok(()),
        }
    }

    /// Drop every translation not copied in the current epoch and free
    /// its backing dataspace.
    ///
    /// Run after a successful pass, when every source still referenced by
    /// a snapshot has been copied in the current epoch. Returns the number
    /// of released translations.
    pub fn release_stale(&self) -> usize {
        let stale: Vec<DataspaceTranslation> = {
            let mut state = lock(&self.state);
            let epoch = state.epoch;
            let sources: Vec<Badge> = state
                .entries
                .values()
                .filter(|entry| entry.copied_epoch != Some(epoch))
                .map(|entry| entry.source)
                .collect();
            sources
                .iter()
                .filter_map(|source| state.entries.remove(source))
                .collect()
        };
        for entry in &stale {
            match self.ram.free(entry.backing) {
                Ok(()) => {
                    debug!(child = %self.child, source = %entry.source, backing = %entry.backing, "stale backing dataspace released");
                }
                Err(err) => {
                    warn!(child = %self.child, backing = %entry.backing, %err, "stale backing dataspace not freed");
                }
            }
        }
        stale.len()
    }

    /// Drop every translation and free all backing dataspaces.
    pub fn release_all(&self) {
        let entries = std::mem::take(&mut lock(&self.state).entries);
        for entry in entries.into_values() {
            if let Err(err) = self.ram.free(entry.backing) {
                warn!(child = %self.child, backing = %entry.backing, %err, "backing dataspace not freed");
            }
        }
    }

    /// Translation record of `source`.
    #[must_use]
    pub fn get(&self, source: Badge) -> Option<DataspaceTranslation> {
        lock(&self.state).entries.get(&source).cloned()
    }

    /// Every translation record, ordered by source badge.
    #[must_use]
    pub fn list(&self) -> Vec<DataspaceTranslation> {
        lock(&self.state).entries.values().cloned().collect()
    }

    /// Number of dataspaces and bytes copied in `epoch`.
    #[must_use]
    pub fn copied_in_epoch(&self, epoch: u64) -> (usize, u64) {
        lock(&self.state)
            .entries
            .values()
            .filter(|entry| entry.copied_epoch == Some(epoch))
            .fold((0, 0), |(count, bytes), entry| {
                (count + 1, bytes + entry.size as u64)
            })
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
