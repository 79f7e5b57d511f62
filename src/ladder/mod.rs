use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{LadderError, Result};
use crate::gateway::{ExchangeGateway, OrderRequest, OrderType};
use crate::monitor::Monitor;

/// Round a quantity down to the exchange's quantity step. Exchanges reject
/// quantities that are not exact multiples of the step.
pub fn round_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    (qty / step).floor() * step
}

/// Split `total` across the percentage ladder, rounding each level down to
/// the quantity step and folding the rounding remainder into the final level
/// so the sum equals `total` exactly.
pub fn split_quantities(
    total: Decimal,
    percentages: &[Decimal],
    step: Decimal,
) -> Result<Vec<Decimal>> {
    if percentages.is_empty() {
        return Err(LadderError::InvalidConfig(
            "cannot split quantity across an empty ladder".to_string(),
        ));
    }
    let pct_sum: Decimal = percentages.iter().sum();
    if pct_sum <= Decimal::ZERO {
        return Err(LadderError::InvalidConfig(
            "percentage ladder sums to zero".to_string(),
        ));
    }

    let mut quantities = Vec::with_capacity(percentages.len());
    let mut allocated = Decimal::ZERO;
    for pct in &percentages[..percentages.len() - 1] {
        let qty = round_step(total * *pct / pct_sum, step);
        allocated += qty;
        quantities.push(qty);
    }
    quantities.push(total - allocated);
    Ok(quantities)
}

/// Mark a level as filled and drop it from future rebalancing. Returns true
/// when this was the first take-profit to complete — the signal for the
/// breakeven transition.
pub fn remove_level(monitor: &mut Monitor, level: u8, qty: Decimal) -> bool {
    let was_first = !monitor.first_tp_hit;
    monitor.mark_tp_filled(level, qty);
    was_first
}

/// Maintains the live take-profit and stop-loss orders so their quantities
/// track the monitor's state. Replacement is amend-first: the order stays
/// live while its quantity changes, so no window exists where a level has no
/// protection.
pub struct LadderManager {
    gateway: Arc<dyn ExchangeGateway>,
}

impl LadderManager {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self { gateway }
    }

    /// Place the initial ladder: one reduce-only limit order per take-profit
    /// level and the conditional stop-loss. Quantities were computed from the
    /// intended position size at monitor construction.
    pub async fn place_initial(&self, monitor: &mut Monitor) -> Result<()> {
        for i in 0..monitor.take_profits.len() {
            if monitor.take_profits[i].filled || monitor.take_profits[i].order_id.is_some() {
                continue;
            }
            let request = OrderRequest {
                symbol: monitor.symbol.clone(),
                side: monitor.side.opposite(),
                order_type: OrderType::Limit,
                qty: monitor.take_profits[i].quantity,
                price: Some(monitor.take_profits[i].price),
                trigger_price: None,
                reduce_only: true,
            };
            match self.gateway.place_order(&request).await {
                Ok(order_id) => monitor.take_profits[i].order_id = Some(order_id),
                Err(e) => {
                    // Level stays unplaced; the next rebalance pass retries.
                    warn!(
                        "⚠️  Failed to place TP{} for {}: {}",
                        monitor.take_profits[i].level,
                        monitor.key(),
                        e
                    );
                }
            }
        }

        if monitor.stop_loss.order_id.is_none() {
            let request = OrderRequest {
                symbol: monitor.symbol.clone(),
                side: monitor.side.opposite(),
                order_type: OrderType::Market,
                qty: monitor.stop_loss.quantity,
                price: None,
                trigger_price: Some(monitor.stop_loss.price),
                reduce_only: true,
            };
            match self.gateway.place_order(&request).await {
                Ok(order_id) => monitor.stop_loss.order_id = Some(order_id),
                Err(e) => warn!("⚠️  Failed to place SL for {}: {}", monitor.key(), e),
            }
        }

        Ok(())
    }

    /// Recompute every unfilled level's quantity from the current remaining
    /// size, preserving filled levels untouched, and push the changes to the
    /// exchange. A rejected amendment leaves the level in its last-known-good
    /// state for the next reconciliation pass.
    pub async fn rebalance(&self, monitor: &mut Monitor) -> Result<()> {
        if monitor.quarantined || monitor.remaining_size <= Decimal::ZERO {
            return Ok(());
        }

        let unfilled: Vec<usize> = monitor
            .take_profits
            .iter()
            .enumerate()
            .filter(|(_, tp)| !tp.filled)
            .map(|(i, _)| i)
            .collect();

        if !unfilled.is_empty() {
            let percentages: Vec<Decimal> = unfilled
                .iter()
                .map(|&i| monitor.take_profits[i].percentage)
                .collect();
            let targets =
                split_quantities(monitor.remaining_size, &percentages, monitor.config.qty_step)?;

            for (&i, &target) in unfilled.iter().zip(targets.iter()) {
                if target <= Decimal::ZERO {
                    continue;
                }
                self.sync_tp_level(monitor, i, target).await;
            }
        }

        // Stop-loss covers the full intended size until the breakeven move;
        // afterwards it tracks the shrinking remainder.
        let sl_target = if monitor.sl_moved_to_breakeven {
            monitor.remaining_size
        } else {
            monitor.position_size
        };
        self.sync_stop_loss(monitor, sl_target).await;

        Ok(())
    }

    async fn sync_tp_level(&self, monitor: &mut Monitor, index: usize, target: Decimal) {
        let (level, price, current_qty, order_id) = {
            let tp = &monitor.take_profits[index];
            (tp.level, tp.price, tp.quantity, tp.order_id.clone())
        };

        match order_id {
            Some(order_id) => {
                if current_qty == target {
                    return;
                }
                match self
                    .gateway
                    .amend_order(&monitor.symbol, &order_id, Some(target), None)
                    .await
                {
                    Ok(()) => {
                        monitor.take_profits[index].quantity = target;
                        debug!(
                            "TP{} on {} resized {} -> {}",
                            level,
                            monitor.key(),
                            current_qty,
                            target
                        );
                    }
                    Err(e) => warn!(
                        "⚠️  Failed to resize TP{} on {} to {}: {} — keeping {}",
                        level,
                        monitor.key(),
                        target,
                        e,
                        current_qty
                    ),
                }
            }
            None => {
                let request = OrderRequest {
                    symbol: monitor.symbol.clone(),
                    side: monitor.side.opposite(),
                    order_type: OrderType::Limit,
                    qty: target,
                    price: Some(price),
                    trigger_price: None,
                    reduce_only: true,
                };
                match self.gateway.place_order(&request).await {
                    Ok(new_id) => {
                        monitor.take_profits[index].order_id = Some(new_id);
                        monitor.take_profits[index].quantity = target;
                    }
                    Err(e) => warn!(
                        "⚠️  Failed to place TP{} on {}: {}",
                        level,
                        monitor.key(),
                        e
                    ),
                }
            }
        }
    }

    async fn sync_stop_loss(&self, monitor: &mut Monitor, target: Decimal) {
        if target <= Decimal::ZERO {
            return;
        }
        match monitor.stop_loss.order_id.clone() {
            Some(order_id) => {
                if monitor.stop_loss.quantity == target {
                    return;
                }
                match self
                    .gateway
                    .amend_order(&monitor.symbol, &order_id, Some(target), None)
                    .await
                {
                    Ok(()) => {
                        monitor.stop_loss.quantity = target;
                        debug!("SL on {} resized to {}", monitor.key(), target);
                    }
                    Err(e) => warn!(
                        "⚠️  Failed to resize SL on {} to {}: {} — keeping {}",
                        monitor.key(),
                        target,
                        e,
                        monitor.stop_loss.quantity
                    ),
                }
            }
            None => {
                let request = OrderRequest {
                    symbol: monitor.symbol.clone(),
                    side: monitor.side.opposite(),
                    order_type: OrderType::Market,
                    qty: target,
                    price: None,
                    trigger_price: Some(monitor.stop_loss.price),
                    reduce_only: true,
                };
                match self.gateway.place_order(&request).await {
                    Ok(new_id) => {
                        monitor.stop_loss.order_id = Some(new_id);
                        monitor.stop_loss.quantity = target;
                    }
                    Err(e) => warn!("⚠️  Failed to place SL on {}: {}", monitor.key(), e),
                }
            }
        }
    }

    /// Cancel every live ladder order. Used after an ambiguous closure so no
    /// reduce-only order dangles on a flat position. Orders already gone are
    /// fine.
    pub async fn cancel_all_orders(&self, monitor: &Monitor) -> Result<()> {
        let mut ids: Vec<String> = Vec::new();
        ids.extend(
            monitor
                .take_profits
                .iter()
                .filter(|tp| !tp.filled)
                .filter_map(|tp| tp.order_id.clone()),
        );
        if let Some(id) = monitor.stop_loss.order_id.clone() {
            ids.push(id);
        }
        ids.extend(
            monitor
                .pending_limit_orders()
                .map(|o| o.order_id.clone()),
        );

        for id in ids {
            match self.gateway.cancel_order(&monitor.symbol, &id).await {
                Ok(()) => {}
                Err(LadderError::OrderNotFound(_)) => {}
                Err(e) => warn!(
                    "⚠️  Failed to cancel order {} on {}: {}",
                    id,
                    monitor.key(),
                    e
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_step_floors_to_step() {
        assert_eq!(round_step(dec!(0.1234), dec!(0.001)), dec!(0.123));
        assert_eq!(round_step(dec!(7), dec!(1)), dec!(7));
        assert_eq!(round_step(dec!(0.0009), dec!(0.001)), dec!(0));
    }

    #[test]
    fn split_sums_exactly_to_total() {
        let qtys = split_quantities(
            dec!(1000),
            &[dec!(85), dec!(5), dec!(5), dec!(5)],
            dec!(1),
        )
        .unwrap();
        assert_eq!(qtys, vec![dec!(850), dec!(50), dec!(50), dec!(50)]);
        let sum: Decimal = qtys.iter().sum();
        assert_eq!(sum, dec!(1000));
    }

    #[test]
    fn split_folds_rounding_remainder_into_last_level() {
        // 100 * 33% = 33.3 rounds down to 33; the last level absorbs the rest.
        let qtys =
            split_quantities(dec!(100), &[dec!(33), dec!(33), dec!(34)], dec!(1)).unwrap();
        assert_eq!(qtys, vec![dec!(33), dec!(33), dec!(34)]);
        let sum: Decimal = qtys.iter().sum();
        assert_eq!(sum, dec!(100));
    }

    #[test]
    fn split_with_fractional_step_closes_exactly() {
        let qtys = split_quantities(
            dec!(0.107),
            &[dec!(85), dec!(5), dec!(5), dec!(5)],
            dec!(0.001),
        )
        .unwrap();
        let sum: Decimal = qtys.iter().sum();
        assert_eq!(sum, dec!(0.107));
        assert_eq!(qtys[0], dec!(0.090));
    }

    #[test]
    fn split_single_level_ladder() {
        let qtys = split_quantities(dec!(42), &[dec!(100)], dec!(1)).unwrap();
        assert_eq!(qtys, vec![dec!(42)]);
    }

    #[test]
    fn split_rejects_empty_ladder() {
        assert!(split_quantities(dec!(100), &[], dec!(1)).is_err());
    }
}
