use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bybit::Side;
use crate::error::{LadderError, Result};
use crate::gateway::{ExchangeGateway, OrderRequest, OrderType};
use crate::monitor::Monitor;

/// Milestone-driven risk state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskState {
    /// Full stop-loss distance; entries may still be filling.
    RiskOn,
    /// Stop-loss at or better than breakeven; no further position growth.
    RiskFree,
}

impl RiskState {
    pub fn of(monitor: &Monitor) -> RiskState {
        if monitor.sl_moved_to_breakeven {
            RiskState::RiskFree
        } else {
            RiskState::RiskOn
        }
    }
}

/// Breakeven price: entry adjusted for round-trip taker fees, so the stop
/// exits the remaining position at a true net-zero.
pub fn breakeven_price(entry_price: Decimal, side: Side, fee_rate: Decimal) -> Decimal {
    let round_trip = fee_rate * Decimal::TWO;
    match side {
        Side::Buy => entry_price * (Decimal::ONE + round_trip),
        Side::Sell => entry_price * (Decimal::ONE - round_trip),
    }
}

/// Drives the one-shot RISK_ON → RISK_FREE transition: once the first
/// take-profit fills, pending entries are cancelled, the stop moves to
/// breakeven, and the milestone flags latch. The transition never reverses
/// and the breakeven price is never re-derived.
pub struct BreakevenController {
    gateway: Arc<dyn ExchangeGateway>,
}

impl BreakevenController {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self { gateway }
    }

    /// Arm the transition after the first take-profit fill. Idempotent.
    pub fn arm(&self, monitor: &mut Monitor) {
        if !monitor.sl_moved_to_breakeven && !monitor.breakeven_pending {
            monitor.breakeven_pending = true;
        }
    }

    /// Execute the pending transition. On failure the transition stays
    /// pending and the caller must hold off further take-profit processing
    /// for this monitor until a later cycle confirms it — an unconfirmed
    /// breakeven leaves the position under-protected.
    ///
    /// Returns the number of cancelled entry orders and the breakeven price
    /// when the transition completed this call.
    pub async fn ensure_risk_free(
        &self,
        monitor: &mut Monitor,
    ) -> Result<Option<(usize, Decimal)>> {
        if monitor.sl_moved_to_breakeven || !monitor.breakeven_pending {
            return Ok(None);
        }

        // (a) No further position growth once profit-taking has begun.
        let cancelled = self.cancel_pending_entries(monitor).await?;

        // (b) Move the stop to the fee-adjusted entry price. The same target
        // price is used on every retry.
        let target = breakeven_price(monitor.entry_price, monitor.side, monitor.config.fee_rate);
        let sl_qty = monitor.remaining_size;

        match monitor.stop_loss.order_id.clone() {
            Some(order_id) => {
                self.gateway
                    .amend_order(&monitor.symbol, &order_id, Some(sl_qty), Some(target))
                    .await?;
            }
            None => {
                // Failsafe: an earlier stop placement never landed. Place a
                // fresh one directly at breakeven rather than leaving the
                // position unprotected.
                let request = OrderRequest {
                    symbol: monitor.symbol.clone(),
                    side: monitor.side.opposite(),
                    order_type: OrderType::Market,
                    qty: sl_qty,
                    price: None,
                    trigger_price: Some(target),
                    reduce_only: true,
                };
                let order_id = self.gateway.place_order(&request).await?;
                monitor.stop_loss.order_id = Some(order_id);
            }
        }

        monitor.stop_loss.price = target;
        monitor.stop_loss.quantity = sl_qty;
        monitor.sl_moved_to_breakeven = true;
        monitor.limit_orders_cancelled = true;
        monitor.breakeven_pending = false;

        info!(
            "🛡️  {} risk-free: SL moved to breakeven {} (entry {}), {} entry orders cancelled",
            monitor.key(),
            target,
            monitor.entry_price,
            cancelled
        );

        Ok(Some((cancelled, target)))
    }

    async fn cancel_pending_entries(&self, monitor: &Monitor) -> Result<usize> {
        let pending: Vec<String> = monitor
            .pending_limit_orders()
            .map(|o| o.order_id.clone())
            .collect();

        let mut cancelled = 0;
        for order_id in pending {
            match self.gateway.cancel_order(&monitor.symbol, &order_id).await {
                Ok(()) => cancelled += 1,
                // Already gone: either filled (the next reconciliation pass
                // will classify it) or cancelled earlier.
                Err(LadderError::OrderNotFound(_)) => cancelled += 1,
                Err(e) => {
                    warn!(
                        "⚠️  Failed to cancel entry {} on {}: {}",
                        order_id,
                        monitor.key(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(cancelled)
    }
}
