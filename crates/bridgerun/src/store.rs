//! Module-visible data most recently pushed to this context by `dataSync`.

use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bridgewire::SyncData;

#[derive(Default)]
pub struct DataStore {
    current: RwLock<SyncData>,
    version: AtomicU64,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored data and returns the new version (starting at 1).
    pub fn update(&self, data: SyncData) -> u64 {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = data;
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> SyncData {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of updates applied so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Resolves a logical asset name through the synced asset table.
    pub fn asset_location(&self, name: &str) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .assets
            .get(name)
            .cloned()
    }
}
