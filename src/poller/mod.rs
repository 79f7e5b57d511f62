use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::breakeven::BreakevenController;
use crate::bybit::{Account, Side};
use crate::error::{LadderError, Result};
use crate::events::{EventBus, MonitorEvent};
use crate::gateway::{ExchangeGateway, OrderType, PositionSnapshot};
use crate::ladder::LadderManager;
use crate::mirror::{Milestone, MirrorSynchronizer};
use crate::monitor::{monitor_key, LadderConfig, LimitEntry, Monitor, NewMonitor};
use crate::reconcile::{self, FillEvent};
use crate::registry::{Checkpointer, MonitorRegistry};

/// Per-account exchange gateways. Credentials are partitioned; a monitor is
/// only ever reconciled through its own account's gateway.
pub struct Gateways {
    pub main: Arc<dyn ExchangeGateway>,
    pub mirror: Option<Arc<dyn ExchangeGateway>>,
}

impl Gateways {
    pub fn for_account(&self, account: Account) -> Option<Arc<dyn ExchangeGateway>> {
        match account {
            Account::Main => Some(self.main.clone()),
            Account::Mirror => self.mirror.clone(),
        }
    }
}

/// Drives one reconciliation task per active monitor key on a fixed
/// interval. Within a key, passes are strictly serialized by the registry's
/// per-monitor lock; a duplicate poll trigger finds the lock held and skips.
pub struct PollSupervisor {
    registry: Arc<MonitorRegistry>,
    checkpointer: Arc<Checkpointer>,
    events: EventBus,
    gateways: Gateways,
    poll_interval: Duration,
}

impl PollSupervisor {
    pub fn new(
        registry: Arc<MonitorRegistry>,
        checkpointer: Arc<Checkpointer>,
        events: EventBus,
        gateways: Gateways,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            checkpointer,
            events,
            gateways,
            poll_interval,
        }
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    /// Create a monitor for a freshly opened position, place its ladder and
    /// checkpoint. The single entry point for new monitors.
    pub async fn register_position(&self, params: NewMonitor) -> Result<()> {
        let gateway = self
            .gateways
            .for_account(params.account)
            .ok_or_else(|| {
                LadderError::InvalidConfig(format!(
                    "no gateway configured for account {}",
                    params.account
                ))
            })?;

        let monitor = Monitor::new(params)?;
        let key = monitor.key();
        let entry = self.registry.insert(monitor)?;

        {
            let mut guard = entry.lock().await;
            LadderManager::new(gateway).place_initial(&mut guard).await?;
        }

        self.checkpointer.flush(&self.registry).await?;
        info!("📊 Monitoring started for {}", key);
        Ok(())
    }

    /// Adopt a position that already exists on the exchange (e.g. found at
    /// startup with outstanding orders). Live entry orders become tracked
    /// limit entries, and ladder orders already on the book are matched to
    /// levels by price instead of being re-placed.
    pub async fn adopt_position(
        &self,
        account: Account,
        symbol: &str,
        side: Side,
        tp_prices: Vec<Decimal>,
        sl_price: Decimal,
        config: LadderConfig,
    ) -> Result<bool> {
        let gateway = self.gateways.for_account(account).ok_or_else(|| {
            LadderError::InvalidConfig(format!("no gateway configured for account {}", account))
        })?;

        let Some(snapshot) = gateway.get_position(symbol, side).await? else {
            return Ok(false);
        };
        let orders = gateway.get_open_orders(symbol).await?;

        let limit_orders: Vec<LimitEntry> = orders
            .iter()
            .filter(|o| {
                o.status.is_live()
                    && !o.reduce_only
                    && o.order_type == OrderType::Limit
                    && o.side == side
            })
            .map(|o| LimitEntry {
                order_id: o.order_id.clone(),
                price: o.price.unwrap_or(snapshot.avg_price),
                quantity: o.qty,
                filled: false,
            })
            .collect();

        let pending: Decimal = limit_orders.iter().map(|o| o.quantity).sum();
        let intended = snapshot.size + pending;

        let mut monitor = Monitor::new(NewMonitor {
            symbol: symbol.to_string(),
            side,
            account,
            intended_size: intended,
            filled_size: snapshot.size,
            entry_price: snapshot.avg_price,
            tp_prices,
            sl_price,
            limit_orders,
            config,
        })?;

        // Match ladder orders already on the book to levels by price.
        for tp in monitor.take_profits.iter_mut() {
            if let Some(existing) = orders.iter().find(|o| {
                o.status.is_live()
                    && o.reduce_only
                    && o.order_type == OrderType::Limit
                    && o.price == Some(tp.price)
            }) {
                tp.order_id = Some(existing.order_id.clone());
                tp.quantity = existing.qty;
            }
        }
        if let Some(existing) = orders.iter().find(|o| {
            o.status.is_live() && o.reduce_only && o.trigger_price == Some(monitor.stop_loss.price)
        }) {
            monitor.stop_loss.order_id = Some(existing.order_id.clone());
            monitor.stop_loss.quantity = existing.qty;
        }

        let key = monitor.key();
        let entry = self.registry.insert(monitor)?;
        {
            let mut guard = entry.lock().await;
            LadderManager::new(gateway).place_initial(&mut guard).await?;
        }
        self.checkpointer.flush(&self.registry).await?;
        info!("📥 Adopted pre-existing position as {}", key);
        Ok(true)
    }

    /// One forced reconciliation pass over every monitor, run once after
    /// rehydration and before the poll loop starts. Stale on-disk state is
    /// never trusted until a fresh snapshot confirms it.
    pub async fn startup_reconcile(&self) {
        info!("Startup reconcile: begin ({} monitors)", self.registry.len());
        let keys = self.registry.keys();
        futures::future::join_all(keys.iter().map(|key| self.poll_once(key, true))).await;
        info!("Startup reconcile: done");
    }

    /// The main poll loop. Spawns one pass per monitor key per tick; passes
    /// for distinct keys run in parallel.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for key in self.registry.keys() {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    supervisor.poll_once(&key, false).await;
                });
            }
        }
    }

    /// A single reconciliation pass for one monitor key. `forced` waits for
    /// the per-key lock instead of skipping when a pass is already running.
    pub async fn poll_once(&self, key: &str, forced: bool) {
        let Some(entry) = self.registry.get(key) else {
            return;
        };

        let mut monitor = if forced {
            entry.lock().await
        } else {
            match entry.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Reconciliation already in flight for {} — skipping", key);
                    return;
                }
            }
        };

        if monitor.quarantined {
            return;
        }

        let Some(gateway) = self.gateways.for_account(monitor.account) else {
            warn!("No gateway for account {} — cannot poll {}", monitor.account, key);
            return;
        };

        // Fetch the fresh snapshot pair. A failed or timed-out fetch is an
        // unknown outcome: skip this cycle and re-query on the next one.
        let snapshot = match gateway.get_position(&monitor.symbol, monitor.side).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                PositionSnapshot::flat(gateway.account(), &monitor.symbol, monitor.side)
            }
            Err(e) => {
                warn!("⚠️  Position fetch failed for {}: {}", key, e);
                return;
            }
        };
        let orders = match gateway.get_open_orders(&monitor.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("⚠️  Order fetch failed for {}: {}", key, e);
                return;
            }
        };

        let events = match reconcile::classify(&monitor, &snapshot, &orders) {
            Ok(events) => events,
            Err(e) => {
                error!("❌ Classification failed for {}: {}", key, e);
                return;
            }
        };

        monitor.last_checked_at = Utc::now();

        if events.is_empty() {
            // Retry a previously unconfirmed breakeven move even on quiet
            // cycles; the position stays under-protected until it lands.
            if monitor.breakeven_pending
                && self.drive_breakeven(&mut monitor, gateway.clone()).await
            {
                if monitor.account == Account::Main {
                    self.sync_mirror(&monitor, true).await;
                }
                drop(monitor);
                let _ = self.checkpointer.save(&self.registry).await;
            }
            return;
        }

        let outcome = match reconcile::apply_events(&mut monitor, &events) {
            Ok(outcome) => outcome,
            Err(e @ LadderError::InvariantViolation { .. }) => {
                monitor.quarantine(&e.to_string());
                self.publish(
                    &monitor,
                    MonitorEvent::MonitorQuarantined {
                        symbol: monitor.symbol.clone(),
                        side: monitor.side,
                        account: monitor.account,
                        reason: e.to_string(),
                    },
                );
                // Snapshotting re-locks every monitor; release this one first.
                drop(monitor);
                let _ = self.checkpointer.flush(&self.registry).await;
                return;
            }
            Err(e) => {
                error!("❌ Applying events failed for {}: {}", key, e);
                return;
            }
        };

        for event in &events {
            self.publish_fill(&monitor, event);
        }

        let ladder = LadderManager::new(gateway.clone());

        // Milestone: first take-profit fill arms the breakeven transition.
        let mut milestone_fired = false;
        if outcome.first_tp_hit {
            BreakevenController::new(gateway.clone()).arm(&mut monitor);
        }
        if monitor.breakeven_pending {
            milestone_fired = self.drive_breakeven(&mut monitor, gateway.clone()).await;
            if monitor.breakeven_pending {
                // Unconfirmed: hold off all further ladder surgery for this
                // monitor until the move lands.
                drop(monitor);
                let _ = self.checkpointer.save(&self.registry).await;
                return;
            }
        }

        if outcome.closed {
            if let Err(e) = ladder.cancel_all_orders(&monitor).await {
                warn!("⚠️  Ladder cleanup failed for {}: {}", key, e);
            }
            self.publish(
                &monitor,
                MonitorEvent::PositionClosed {
                    symbol: monitor.symbol.clone(),
                    side: monitor.side,
                },
            );
            if let Err(e) = self.registry.remove_closed(&monitor) {
                error!("❌ Failed to remove closed monitor {}: {}", key, e);
            }
            drop(monitor);
            let _ = self.checkpointer.flush(&self.registry).await;
            return;
        }

        if let Err(e) = ladder.rebalance(&mut monitor).await {
            warn!("⚠️  Rebalance failed for {}: {}", key, e);
        }

        // Mirror the structural changes and milestone onto the secondary
        // account, sized by the mirror's own position.
        if monitor.account == Account::Main {
            self.sync_mirror(&monitor, milestone_fired).await;
        }

        drop(monitor);
        let _ = self.checkpointer.save(&self.registry).await;
    }

    /// Attempt the pending breakeven transition. Returns true when it
    /// completed during this call.
    async fn drive_breakeven(
        &self,
        monitor: &mut Monitor,
        gateway: Arc<dyn ExchangeGateway>,
    ) -> bool {
        let controller = BreakevenController::new(gateway);
        match controller.ensure_risk_free(monitor).await {
            Ok(Some((cancelled, price))) => {
                self.publish(
                    monitor,
                    MonitorEvent::BreakevenApplied {
                        symbol: monitor.symbol.clone(),
                        side: monitor.side,
                        breakeven_price: price,
                    },
                );
                if cancelled > 0 {
                    self.publish(
                        monitor,
                        MonitorEvent::LimitOrdersCancelled {
                            symbol: monitor.symbol.clone(),
                            side: monitor.side,
                            cancelled,
                        },
                    );
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    "⚠️  Breakeven move unconfirmed for {} — will retry: {}",
                    monitor.key(),
                    e
                );
                false
            }
        }
    }

    async fn sync_mirror(&self, main: &Monitor, milestone_fired: bool) {
        let Some(mirror_gateway) = self.gateways.mirror.clone() else {
            return;
        };
        let mirror_key = monitor_key(&main.symbol, main.side, Account::Mirror);
        let Some(entry) = self.registry.get(&mirror_key) else {
            return;
        };

        // Lock ordering is always main -> mirror, never the reverse, so the
        // two poll tasks cannot deadlock.
        let mut mirror = entry.lock().await;
        if mirror.quarantined {
            return;
        }

        let synchronizer = MirrorSynchronizer::new(mirror_gateway);
        if milestone_fired {
            if let Err(e) = synchronizer
                .propagate_milestone(&mut mirror, Milestone::RiskFree)
                .await
            {
                warn!(
                    "⚠️  Milestone propagation to {} failed — will retry: {}",
                    mirror_key, e
                );
            }
        }
        if let Err(e) = synchronizer.sync_ladder(main, &mut mirror).await {
            warn!("⚠️  Mirror ladder sync failed for {}: {}", mirror_key, e);
        }
    }

    fn publish_fill(&self, monitor: &Monitor, event: &FillEvent) {
        let mapped = match event {
            FillEvent::LimitFilled { order_id, qty, .. } => MonitorEvent::LimitFilled {
                symbol: monitor.symbol.clone(),
                side: monitor.side,
                order_id: order_id.clone(),
                qty: *qty,
            },
            FillEvent::TakeProfitFilled { level, qty, price } => MonitorEvent::TakeProfitFilled {
                symbol: monitor.symbol.clone(),
                side: monitor.side,
                level: *level,
                qty: *qty,
                price: *price,
            },
            FillEvent::StopLossFilled { qty, price } => MonitorEvent::StopLossFilled {
                symbol: monitor.symbol.clone(),
                side: monitor.side,
                qty: *qty,
                price: *price,
            },
            // Closure is published after teardown completes.
            FillEvent::PositionClosed => return,
        };
        self.publish(monitor, mapped);
    }

    /// Mirror monitors never originate user-facing notifications; their
    /// transitions are logged but not published.
    fn publish(&self, monitor: &Monitor, event: MonitorEvent) {
        match monitor.account {
            Account::Main => self.events.publish(event),
            Account::Mirror => debug!("Mirror transition on {}: {:?}", monitor.key(), event),
        }
    }
}
