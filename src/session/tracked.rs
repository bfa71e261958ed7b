//! Hot/cold bookkeeping of one monitored object kind.
//!
//! [`TrackedObjects`] keeps the live table mutated by intercepted calls,
//! the sets of objects created and destroyed since the last checkpoint,
//! and the snapshot committed by the last checkpoint. A checkpoint step
//! opens a [`Merge`], adjusts the candidate records, and commits it; a
//! merge dropped without commit puts the created/destroyed sets back so
//! the next checkpoint sees them again.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Mutex;

use tracing::warn;

use super::lock;
use crate::models::{Kcap, Stored};

struct Hot<K, T> {
    live: BTreeMap<K, T>,
    created: BTreeSet<K>,
    destroyed: BTreeMap<K, T>,
}

impl<K, T> Default for Hot<K, T> {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            created: BTreeSet::new(),
            destroyed: BTreeMap::new(),
        }
    }
}

/// Live table, created/destroyed sets and snapshot of one object kind.
///
/// Lock order is hot state first, snapshot second.
pub struct TrackedObjects<K, T> {
    kind: &'static str,
    hot: Mutex<Hot<K, T>>,
    snapshot: Mutex<BTreeMap<K, Stored<T>>>,
}

/// Counts produced by a committed merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Objects added to the snapshot.
    pub created: usize,
    /// Objects removed from the snapshot.
    pub destroyed: usize,
    /// Snapshot size after the merge.
    pub total: usize,
}

impl<K, T> TrackedObjects<K, T>
where
    K: Ord + Copy + Debug,
    T: Clone,
{
    /// Create empty bookkeeping for objects of `kind` (used in log fields).
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            hot: Mutex::new(Hot::default()),
            snapshot: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a newly created object.
    pub fn insert(&self, key: K, record: T) {
        let mut hot = lock(&self.hot);
        hot.destroyed.remove(&key);
        hot.live.insert(key, record);
        hot.created.insert(key);
    }

    /// Record the destruction of an object and return its live record.
    ///
    /// An object created since the last checkpoint simply disappears; an
    /// object already in the snapshot moves to the destroyed set. Unknown
    /// keys return `None`.
    pub fn remove(&self, key: K) -> Option<T> {
        let mut hot = lock(&self.hot);
        let record = hot.live.remove(&key)?;
        if !hot.created.remove(&key) {
            hot.destroyed.insert(key, record.clone());
        }
        Some(record)
    }

    /// Drop a live object without recording its destruction.
    ///
    /// Used for objects whose kernel counterpart vanished behind the
    /// session's back; the next committed merge leaves it out of the
    /// snapshot.
    pub fn forget(&self, key: K) -> Option<T> {
        let mut hot = lock(&self.hot);
        hot.created.remove(&key);
        hot.destroyed.remove(&key);
        hot.live.remove(&key)
    }

    /// Mutate a live record in place; returns whether the object is tracked.
    pub fn update(&self, key: K, f: impl FnOnce(&mut T)) -> bool {
        let mut hot = lock(&self.hot);
        match hot.live.get_mut(&key) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Clone of the live record for `key`.
    #[must_use]
    pub fn get(&self, key: K) -> Option<T> {
        lock(&self.hot).live.get(&key).cloned()
    }

    /// Whether `key` is currently live.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        lock(&self.hot).live.contains_key(&key)
    }

    /// Clones of every live record, ordered by key.
    #[must_use]
    pub fn live(&self) -> Vec<T> {
        lock(&self.hot).live.values().cloned().collect()
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.hot).live.len()
    }

    /// Whether no object is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.hot).live.is_empty()
    }

    /// First live record matching `pred`.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        lock(&self.hot).live.values().find(|r| pred(r)).cloned()
    }

    /// Keys created since the last checkpoint.
    #[must_use]
    pub fn pending_created(&self) -> Vec<K> {
        lock(&self.hot).created.iter().copied().collect()
    }

    /// Keys destroyed since the last checkpoint.
    #[must_use]
    pub fn pending_destroyed(&self) -> Vec<K> {
        lock(&self.hot).destroyed.keys().copied().collect()
    }

    /// The snapshot committed by the last checkpoint, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Stored<T>> {
        lock(&self.snapshot).values().cloned().collect()
    }

    /// Snapshot entry for `key`.
    #[must_use]
    pub fn snapshot_get(&self, key: K) -> Option<Stored<T>> {
        lock(&self.snapshot).get(&key).cloned()
    }

    /// Set the kcap of every snapshot entry.
    pub fn annotate(&self, kcap_of: impl Fn(&T) -> Kcap) {
        for stored in lock(&self.snapshot).values_mut() {
            stored.kcap = kcap_of(&stored.record);
        }
    }

    /// Remove every live object and return the records.
    ///
    /// Used when the session closes; the snapshot is left untouched.
    pub fn drain(&self) -> Vec<T> {
        let mut hot = lock(&self.hot);
        let live = std::mem::take(&mut hot.live);
        for (key, record) in &live {
            if !hot.created.remove(key) {
                hot.destroyed.insert(*key, record.clone());
            }
        }
        live.into_values().collect()
    }

    /// Take the created/destroyed sets and build the candidate snapshot
    /// from the live table.
    ///
    /// Candidate entries keep the kcap of their previous snapshot entry.
    pub fn begin_merge(&self) -> Merge<'_, K, T> {
        let mut hot = lock(&self.hot);
        let created = std::mem::take(&mut hot.created);
        let destroyed = std::mem::take(&mut hot.destroyed);
        let previous = lock(&self.snapshot);
        let records = hot
            .live
            .iter()
            .map(|(key, record)| {
                let kcap = previous.get(key).map_or(Kcap::INVALID, |s| s.kcap);
                (
                    *key,
                    Stored {
                        kcap,
                        record: record.clone(),
                    },
                )
            })
            .collect();
        Merge {
            objects: self,
            created,
            destroyed,
            records,
            committed: false,
        }
    }
}

/// An in-progress merge of created/destroyed objects into the snapshot.
pub struct Merge<'a, K, T>
where
    K: Ord + Copy + Debug,
    T: Clone,
{
    objects: &'a TrackedObjects<K, T>,
    created: BTreeSet<K>,
    destroyed: BTreeMap<K, T>,
    records: BTreeMap<K, Stored<T>>,
    committed: bool,
}

impl<K, T> Merge<'_, K, T>
where
    K: Ord + Copy + Debug,
    T: Clone,
{
    /// Objects created since the last checkpoint.
    #[must_use]
    pub fn created(&self) -> &BTreeSet<K> {
        &self.created
    }

    /// Objects destroyed since the last checkpoint, with their last live record.
    #[must_use]
    pub fn destroyed(&self) -> &BTreeMap<K, T> {
        &self.destroyed
    }

    /// Candidate snapshot records.
    pub fn records_mut(&mut self) -> &mut BTreeMap<K, Stored<T>> {
        &mut self.records
    }

    /// Replace the snapshot with the candidate.
    pub fn commit(mut self) -> MergeSummary {
        let summary = MergeSummary {
            created: self.created.len(),
            destroyed: self.destroyed.len(),
            total: self.records.len(),
        };
        *lock(&self.objects.snapshot) = std::mem::take(&mut self.records);
        self.committed = true;
        summary
    }
}

impl<K, T> Drop for Merge<'_, K, T>
where
    K: Ord + Copy + Debug,
    T: Clone,
{
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut hot = lock(&self.objects.hot);
        for key in std::mem::take(&mut self.created) {
            if hot.live.contains_key(&key) {
                hot.created.insert(key);
            } else {
                // created and destroyed again while the merge was open
                hot.destroyed.remove(&key);
            }
        }
        for (key, record) in std::mem::take(&mut self.destroyed) {
            hot.destroyed.entry(key).or_insert(record);
        }
        warn!(kind = self.objects.kind, "merge aborted, snapshot kept");
    }
}

/// Scalar state of a session plus its snapshot.
pub struct TrackedValue<T> {
    hot: Mutex<T>,
    snapshot: Mutex<Option<Stored<T>>>,
}

impl<T: Clone> TrackedValue<T> {
    /// Track `initial` as the live value.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            hot: Mutex::new(initial),
            snapshot: Mutex::new(None),
        }
    }

    /// Mutate the live value.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut lock(&self.hot));
    }

    /// Clone of the live value.
    #[must_use]
    pub fn get(&self) -> T {
        lock(&self.hot).clone()
    }

    /// Copy the live value into the snapshot, keeping its kcap.
    pub fn checkpoint(&self) {
        let record = lock(&self.hot).clone();
        let mut snapshot = lock(&self.snapshot);
        let kcap = snapshot.as_ref().map_or(Kcap::INVALID, |s| s.kcap);
        *snapshot = Some(Stored { kcap, record });
    }

    /// The value committed by the last checkpoint.
    #[must_use]
    pub fn snapshot(&self) -> Option<Stored<T>> {
        lock(&self.snapshot).clone()
    }

    /// Set the kcap of the snapshot entry.
    pub fn annotate(&self, kcap_of: impl Fn(&T) -> Kcap) {
        if let Some(stored) = lock(&self.snapshot).as_mut() {
            stored.kcap = kcap_of(&stored.record);
        }
    }
}

impl<T: Clone + Default> Default for TrackedValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
