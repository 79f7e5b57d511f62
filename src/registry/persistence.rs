use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::monitor::Monitor;

use super::MonitorRegistry;

pub const CHECKPOINT_VERSION: u32 = 1;

/// On-disk snapshot of the full monitor registry. JSON so the operator can
/// inspect it; only this process ever writes it.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryCheckpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub monitors: BTreeMap<String, Monitor>,
}

/// Writes debounced registry checkpoints. Callers request a save after every
/// state-changing event; writes actually hit disk at most once per debounce
/// window so a burst of fills cannot cause an I/O storm. `flush` bypasses
/// the debounce for shutdown.
pub struct Checkpointer {
    path: PathBuf,
    debounce: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl Checkpointer {
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self {
            path,
            debounce,
            last_write: Mutex::new(None),
        }
    }

    /// Save if the debounce window has elapsed. Returns whether a write
    /// happened.
    pub async fn save(&self, registry: &MonitorRegistry) -> Result<bool> {
        {
            let last = self.last_write.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.debounce {
                    return Ok(false);
                }
            }
        }
        self.write(registry).await?;
        Ok(true)
    }

    /// Save unconditionally.
    pub async fn flush(&self, registry: &MonitorRegistry) -> Result<()> {
        self.write(registry).await
    }

    async fn write(&self, registry: &MonitorRegistry) -> Result<()> {
        let checkpoint = RegistryCheckpoint {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            monitors: registry.snapshot().await,
        };
        let payload = serde_json::to_vec_pretty(&checkpoint)?;

        // Write-then-rename so a crash mid-write never truncates the last
        // good checkpoint.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *self.last_write.lock() = Some(Instant::now());
        debug!(
            "💾 Checkpoint saved: {} monitors -> {}",
            checkpoint.monitors.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the last checkpoint, if one exists. The caller must reconcile
    /// every rehydrated monitor against a fresh exchange snapshot before
    /// resuming normal polling — on-disk state is never trusted blindly.
    pub async fn load(&self) -> Result<Option<RegistryCheckpoint>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let checkpoint: RegistryCheckpoint = serde_json::from_slice(&bytes)?;
                if checkpoint.version != CHECKPOINT_VERSION {
                    warn!(
                        "⚠️  Checkpoint version {} != {} — ignoring {}",
                        checkpoint.version,
                        CHECKPOINT_VERSION,
                        self.path.display()
                    );
                    return Ok(None);
                }
                info!(
                    "📥 Checkpoint loaded: {} monitors (saved {})",
                    checkpoint.monitors.len(),
                    checkpoint.saved_at
                );
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rehydrate a registry from a checkpoint, skipping monitors that were
    /// already closed when the checkpoint was taken.
    pub fn rehydrate(
        registry: &MonitorRegistry,
        checkpoint: RegistryCheckpoint,
    ) -> Result<usize> {
        let mut restored = 0;
        for (key, monitor) in checkpoint.monitors {
            if monitor.phase == crate::monitor::Phase::Closed {
                debug!("Skipping closed monitor {} from checkpoint", key);
                continue;
            }
            registry.insert(monitor)?;
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bybit::{Account, Side};
    use crate::monitor::{LadderConfig, NewMonitor, Phase};
    use rust_decimal_macros::dec;

    fn test_monitor(symbol: &str) -> Monitor {
        Monitor::new(NewMonitor {
            symbol: symbol.to_string(),
            side: Side::Buy,
            account: Account::Main,
            intended_size: dec!(100),
            filled_size: dec!(100),
            entry_price: dec!(10),
            tp_prices: vec![dec!(11)],
            sl_price: dec!(9),
            limit_orders: vec![],
            config: LadderConfig {
                tp_percentages: vec![dec!(100)],
                fee_rate: dec!(0.00055),
                qty_step: dec!(1),
            },
        })
        .unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ladder-checkpoint-{}-{}.json",
            std::process::id(),
            name
        ))
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let path = temp_path("roundtrip");
        let checkpointer = Checkpointer::new(path.clone(), Duration::from_secs(0));

        let registry = MonitorRegistry::new();
        registry.insert(test_monitor("BTCUSDT")).unwrap();
        checkpointer.flush(&registry).await.unwrap();

        let loaded = checkpointer.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.monitors.len(), 1);
        let restored = &loaded.monitors["BTCUSDT_Buy_main"];
        assert_eq!(restored.position_size, dec!(100));
        assert_eq!(restored.entry_price, dec!(10));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn rehydrate_skips_closed_monitors() {
        let registry = MonitorRegistry::new();
        let mut closed = test_monitor("ETHUSDT");
        closed.mark_closed();

        let mut monitors = BTreeMap::new();
        monitors.insert(test_monitor("BTCUSDT").key(), test_monitor("BTCUSDT"));
        monitors.insert(closed.key(), closed);

        let restored = Checkpointer::rehydrate(
            &registry,
            RegistryCheckpoint {
                version: CHECKPOINT_VERSION,
                saved_at: Utc::now(),
                monitors,
            },
        )
        .unwrap();
        assert_eq!(restored, 1);
        assert!(registry.get("BTCUSDT_Buy_main").is_some());
        assert!(registry.get("ETHUSDT_Buy_main").is_none());
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let checkpointer = Checkpointer::new(temp_path("missing"), Duration::from_secs(0));
        assert!(checkpointer.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn debounce_suppresses_rapid_saves() {
        let path = temp_path("debounce");
        let checkpointer = Checkpointer::new(path.clone(), Duration::from_secs(60));
        let registry = MonitorRegistry::new();
        registry.insert(test_monitor("BTCUSDT")).unwrap();

        assert!(checkpointer.save(&registry).await.unwrap());
        assert!(!checkpointer.save(&registry).await.unwrap());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn rehydrated_phase_survives_serde() {
        let mut monitor = test_monitor("BTCUSDT");
        monitor.mark_tp_filled(1, dec!(50));
        assert_eq!(monitor.phase, Phase::ProfitTaking);

        let json = serde_json::to_string(&monitor).unwrap();
        let back: Monitor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase, Phase::ProfitTaking);
        assert!(back.first_tp_hit);
        assert_eq!(back.remaining_size, dec!(50));
    }
}
