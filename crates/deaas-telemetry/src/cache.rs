//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-asset metric cache shared by providers and readers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::model::{AssetKey, AssetKind, MetricSet};

type Entry = Arc<Mutex<MetricSet>>;

/// Latest known metrics per watched asset.
///
/// The outer map is only write-locked when an asset is first inserted. Each
/// entry has its own lock, so metric writes for one asset never block reads
/// of another. Readers always receive an owned copy.
#[derive(Debug, Default)]
pub struct MetricCache {
    entries: RwLock<BTreeMap<AssetKey, Entry>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `init()` for `key` unless it already exists. Returns true on insert.
    pub fn insert_if_absent<F>(&self, key: AssetKey, init: F) -> bool
    where
        F: FnOnce() -> MetricSet,
    {
        if self.entries.read().contains_key(&key) {
            return false;
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, Arc::new(Mutex::new(init())));
        true
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.entries.read().contains_key(key)
    }

    fn entry(&self, key: &AssetKey) -> Option<Entry> {
        self.entries.read().get(key).cloned()
    }

    pub fn snapshot(&self, key: &AssetKey) -> Option<MetricSet> {
        self.entry(key).map(|entry| entry.lock().clone())
    }

    /// Snapshot for `key`, or the all-unknown set when the asset is not cached.
    pub fn snapshot_or_unknown(&self, key: &AssetKey) -> MetricSet {
        self.snapshot(key)
            .unwrap_or_else(|| MetricSet::unknown(key.kind))
    }

    /// Mutate one entry under its lock. Returns `None` when `key` is not cached.
    pub fn update<R, F>(&self, key: &AssetKey, apply: F) -> Option<R>
    where
        F: FnOnce(&mut MetricSet) -> R,
    {
        self.entry(key).map(|entry| apply(&mut entry.lock()))
    }

    pub fn replace(&self, key: &AssetKey, metrics: MetricSet) -> bool {
        self.update(key, |current| *current = metrics).is_some()
    }

    /// Cached keys in stable order, optionally restricted to one kind.
    pub fn keys(&self, kind: Option<AssetKind>) -> Vec<AssetKey> {
        self.entries
            .read()
            .keys()
            .filter(|key| kind.map_or(true, |kind| key.kind == kind))
            .copied()
            .collect()
    }

    pub fn count(&self, kind: AssetKind) -> usize {
        self.entries
            .read()
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
