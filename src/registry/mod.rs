pub mod persistence;

pub use persistence::{Checkpointer, RegistryCheckpoint};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{LadderError, Result};
use crate::monitor::{Monitor, Phase};

/// The single authoritative collection of active monitors, keyed by
/// `"{symbol}_{side}_{account}"`. Each monitor sits behind its own async
/// mutex: reconciliation for one key is strictly serialized while distinct
/// keys proceed in parallel.
pub struct MonitorRegistry {
    monitors: DashMap<String, Arc<Mutex<Monitor>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            monitors: DashMap::new(),
        }
    }

    /// Insert a freshly constructed monitor. A duplicate key is an error,
    /// never a silent overwrite — losing an existing monitor's state mid-
    /// position is exactly the corruption this registry exists to prevent.
    pub fn insert(&self, monitor: Monitor) -> Result<Arc<Mutex<Monitor>>> {
        let key = monitor.key();
        match self.monitors.entry(key.clone()) {
            Entry::Occupied(_) => Err(LadderError::DuplicateMonitor(key)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(Mutex::new(monitor));
                slot.insert(entry.clone());
                info!("✅ Monitor registered: {}", key);
                Ok(entry)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Mutex<Monitor>>> {
        self.monitors.get(key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.monitors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Remove a monitor whose lifecycle has ended. Removal is permanent and
    /// audited; only CLOSED monitors may leave the registry.
    pub fn remove_closed(&self, monitor: &Monitor) -> Result<()> {
        if monitor.phase != Phase::Closed {
            return Err(LadderError::InvariantViolation {
                key: monitor.key(),
                reason: format!("removal attempted in phase {:?}", monitor.phase),
            });
        }
        let key = monitor.key();
        self.monitors.remove(&key);
        info!(
            "🗑️  Monitor removed: {} (filled TP levels {:?}, cumulative filled {})",
            key, monitor.filled_tp_levels, monitor.cumulative_filled
        );
        Ok(())
    }

    /// Clone the full registry state for checkpointing. Takes each per-key
    /// lock briefly, so the snapshot is consistent per monitor.
    pub async fn snapshot(&self) -> BTreeMap<String, Monitor> {
        let mut out = BTreeMap::new();
        for entry in self.monitors.iter() {
            let monitor = entry.value().lock().await;
            out.insert(entry.key().clone(), monitor.clone());
        }
        out
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
