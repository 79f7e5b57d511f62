use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::bybit::Side;
use crate::error::{LadderError, Result};
use crate::gateway::{OpenOrder, PositionSnapshot};
use crate::ladder;
use crate::monitor::{Monitor, Phase};

/// A classified state change, produced at most once per underlying fill.
#[derive(Debug, Clone, PartialEq)]
pub enum FillEvent {
    LimitFilled {
        order_id: String,
        price: Decimal,
        qty: Decimal,
    },
    TakeProfitFilled {
        level: u8,
        qty: Decimal,
        price: Decimal,
    },
    StopLossFilled {
        qty: Decimal,
        price: Decimal,
    },
    PositionClosed,
}

/// What applying a batch of events changed, for the driver to act on.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOutcome {
    pub entry_fills: usize,
    pub tp_fills: usize,
    pub sl_fills: usize,
    /// The first take-profit of this monitor's lifetime completed in this
    /// pass — the breakeven trigger.
    pub first_tp_hit: bool,
    pub closed: bool,
}

/// Classify what changed between the monitor's recorded state and a fresh
/// (position, open orders) snapshot pair.
///
/// Detection is keyed on order ids and explicit statuses, never on size
/// deltas alone: a pure magnitude comparison is ambiguous when several
/// orders could explain the same delta. Orders reported `Triggered` are
/// still live — classification waits until the exchange confirms the fill
/// or the position size moves.
pub fn classify(
    monitor: &Monitor,
    snapshot: &PositionSnapshot,
    orders: &[OpenOrder],
) -> Result<Vec<FillEvent>> {
    // Snapshots are strictly account-scoped; evaluating a monitor against
    // the wrong account's data caused false fills in the past.
    if snapshot.account != monitor.account
        || snapshot.symbol != monitor.symbol
        || snapshot.side != monitor.side
    {
        return Err(LadderError::SnapshotMismatch {
            expected: monitor.key(),
            got: format!(
                "{}_{}_{}",
                snapshot.symbol, snapshot.side, snapshot.account
            ),
        });
    }

    if monitor.phase == Phase::Closed || monitor.quarantined {
        return Ok(Vec::new());
    }

    let live: HashSet<&str> = orders
        .iter()
        .filter(|o| o.status.is_live())
        .map(|o| o.order_id.as_str())
        .collect();
    let reported_filled: HashSet<&str> = orders
        .iter()
        .filter(|o| o.status == crate::bybit::OrderStatus::Filled)
        .map(|o| o.order_id.as_str())
        .collect();

    let mut events = Vec::new();

    // --- Entry fills -----------------------------------------------------
    let mut growth_budget = (snapshot.size - monitor.remaining_size).max(Decimal::ZERO);
    let mut entered = Decimal::ZERO;

    for entry in monitor.pending_limit_orders() {
        let id = entry.order_id.as_str();
        let confirmed = if reported_filled.contains(id) {
            true
        } else if !live.contains(id) {
            // Vanished without an explicit status: only classify once the
            // position growth evidences the fill. An externally cancelled
            // entry produces no growth and stays unclassified.
            growth_budget >= entry.quantity
        } else {
            false
        };

        if confirmed {
            growth_budget = (growth_budget - entry.quantity).max(Decimal::ZERO);
            entered += entry.quantity;
            events.push(FillEvent::LimitFilled {
                order_id: entry.order_id.clone(),
                price: entry.price,
                qty: entry.quantity,
            });
        }
    }

    let remaining_expected = monitor.remaining_size + entered;
    let mut reduction_budget = (remaining_expected - snapshot.size).max(Decimal::ZERO);

    // --- Exit fills ------------------------------------------------------
    let mut vanished_tps: Vec<(u8, Decimal, Decimal)> = Vec::new();
    let mut explicit_tps: Vec<(u8, Decimal, Decimal)> = Vec::new();

    for tp in monitor.unfilled_tp_levels() {
        let Some(id) = tp.order_id.as_deref() else {
            continue;
        };
        if reported_filled.contains(id) {
            explicit_tps.push((tp.level, tp.quantity, tp.price));
        } else if !live.contains(id) {
            vanished_tps.push((tp.level, tp.quantity, tp.price));
        }
    }

    let (sl_explicit, sl_vanished) = match monitor.stop_loss.order_id.as_deref() {
        Some(id) => (
            reported_filled.contains(id),
            !reported_filled.contains(id) && !live.contains(id),
        ),
        None => (false, false),
    };

    for (level, qty, price) in explicit_tps {
        reduction_budget = (reduction_budget - qty).max(Decimal::ZERO);
        events.push(FillEvent::TakeProfitFilled { level, qty, price });
    }

    let mut closed_emitted = false;

    if !vanished_tps.is_empty() && sl_vanished {
        // Both sides of the book disappeared in the same poll cycle with no
        // explicit status for either. Prefer the interpretation consistent
        // with the mark price; when that does not single one out, classify
        // as a closure and let the ladder manager reconcile order state
        // afterwards rather than guess.
        if snapshot.size.is_zero() {
            events.push(FillEvent::PositionClosed);
            closed_emitted = true;
        } else {
            let tp_consistent = vanished_tps
                .iter()
                .all(|(_, _, price)| trigger_consistent_tp(monitor.side, snapshot.mark_price, *price));
            let sl_consistent =
                trigger_consistent_sl(monitor.side, snapshot.mark_price, monitor.stop_loss.price);

            match (tp_consistent, sl_consistent) {
                (true, false) => {
                    for (level, qty, price) in vanished_tps {
                        if reduction_budget >= qty {
                            reduction_budget -= qty;
                            events.push(FillEvent::TakeProfitFilled { level, qty, price });
                        }
                    }
                }
                (false, true) => {
                    let qty = monitor.stop_loss.quantity.min(remaining_expected);
                    if reduction_budget >= qty {
                        events.push(FillEvent::StopLossFilled {
                            qty,
                            price: monitor.stop_loss.price,
                        });
                    }
                }
                _ => {
                    warn!(
                        "Ambiguous TP/SL disappearance on {} (mark {}) — treating as closure",
                        monitor.key(),
                        snapshot.mark_price
                    );
                    events.push(FillEvent::PositionClosed);
                    closed_emitted = true;
                }
            }
        }
    } else {
        for (level, qty, price) in vanished_tps {
            if reduction_budget >= qty {
                reduction_budget -= qty;
                events.push(FillEvent::TakeProfitFilled { level, qty, price });
            } else {
                // Order gone but the position has not shrunk to match yet;
                // wait for a later poll to confirm.
                debug!(
                    "TP{} on {} vanished without matching size reduction — holding off",
                    level,
                    monitor.key()
                );
            }
        }

        if sl_explicit || sl_vanished {
            let consumed: Decimal = events
                .iter()
                .map(|e| match e {
                    FillEvent::TakeProfitFilled { qty, .. } => *qty,
                    _ => Decimal::ZERO,
                })
                .sum();
            let qty = monitor
                .stop_loss
                .quantity
                .min(remaining_expected - consumed)
                .max(Decimal::ZERO);
            if qty > Decimal::ZERO
                && (sl_explicit || reduction_budget >= qty || snapshot.size.is_zero())
            {
                events.push(FillEvent::StopLossFilled {
                    qty,
                    price: monitor.stop_loss.price,
                });
            }
        }
    }

    // --- Closure ---------------------------------------------------------
    // An unexplained residue on a flat position means something closed it
    // that none of the tracked orders account for.
    if snapshot.size.is_zero() && remaining_expected > Decimal::ZERO && !closed_emitted {
        let consumed: Decimal = events
            .iter()
            .map(|e| match e {
                FillEvent::TakeProfitFilled { qty, .. } => *qty,
                FillEvent::StopLossFilled { qty, .. } => *qty,
                _ => Decimal::ZERO,
            })
            .sum();
        if remaining_expected - consumed > Decimal::ZERO {
            events.push(FillEvent::PositionClosed);
        }
    }

    Ok(events)
}

/// Apply classified events to the monitor in the fixed order the classifier
/// produced them (entries, then take-profits, then stop-loss, then closure —
/// later classifications depend on size deltas consumed by earlier ones).
pub fn apply_events(monitor: &mut Monitor, events: &[FillEvent]) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();

    for event in events {
        match event {
            FillEvent::LimitFilled { order_id, price, qty } => {
                if let Some(order) = monitor
                    .limit_orders
                    .iter_mut()
                    .find(|o| o.order_id == *order_id)
                {
                    if order.filled {
                        continue; // already processed; never double-count
                    }
                    order.filled = true;
                }
                monitor.absorb_entry_fill(*price, *qty);
                if monitor.phase == Phase::Building && monitor.is_fully_entered() {
                    monitor.phase = Phase::Monitoring;
                }
                outcome.entry_fills += 1;
            }
            FillEvent::TakeProfitFilled { level, qty, .. } => {
                if ladder::remove_level(monitor, *level, *qty) {
                    outcome.first_tp_hit = true;
                }
                if monitor.remaining_size.is_zero() {
                    monitor.phase = Phase::Closed;
                    outcome.closed = true;
                }
                outcome.tp_fills += 1;
            }
            FillEvent::StopLossFilled { qty, .. } => {
                monitor.mark_sl_filled(*qty);
                if monitor.remaining_size.is_zero() {
                    monitor.phase = Phase::Closed;
                    outcome.closed = true;
                }
                outcome.sl_fills += 1;
            }
            FillEvent::PositionClosed => {
                monitor.mark_closed();
                outcome.closed = true;
            }
        }
    }

    monitor.last_checked_at = Utc::now();
    monitor.check_invariants()?;
    Ok(outcome)
}

fn trigger_consistent_tp(side: Side, mark: Decimal, tp_price: Decimal) -> bool {
    match side {
        Side::Buy => mark >= tp_price,
        Side::Sell => mark <= tp_price,
    }
}

fn trigger_consistent_sl(side: Side, mark: Decimal, sl_price: Decimal) -> bool {
    match side {
        Side::Buy => mark <= sl_price,
        Side::Sell => mark >= sl_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bybit::{Account, OrderStatus};
    use crate::gateway::OrderType;
    use crate::monitor::{LadderConfig, LimitEntry, NewMonitor};
    use rust_decimal_macros::dec;

    fn test_monitor() -> Monitor {
        Monitor::new(NewMonitor {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            account: Account::Main,
            intended_size: dec!(1000),
            filled_size: dec!(1000),
            entry_price: dec!(100),
            tp_prices: vec![dec!(110), dec!(120), dec!(130), dec!(140)],
            sl_price: dec!(95),
            limit_orders: vec![],
            config: LadderConfig {
                tp_percentages: vec![dec!(85), dec!(5), dec!(5), dec!(5)],
                fee_rate: dec!(0.00055),
                qty_step: dec!(1),
            },
        })
        .unwrap()
    }

    fn with_order_ids(mut monitor: Monitor) -> Monitor {
        for (i, tp) in monitor.take_profits.iter_mut().enumerate() {
            tp.order_id = Some(format!("tp{}", i + 1));
        }
        monitor.stop_loss.order_id = Some("sl1".to_string());
        monitor
    }

    fn snapshot(size: Decimal, mark: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            account: Account::Main,
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            size,
            avg_price: dec!(100),
            mark_price: mark,
        }
    }

    fn order(id: &str, status: OrderStatus, qty: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: Some(dec!(110)),
            trigger_price: None,
            qty,
            status,
            reduce_only: true,
        }
    }

    fn ladder_orders(monitor: &Monitor) -> Vec<OpenOrder> {
        let mut orders: Vec<OpenOrder> = monitor
            .take_profits
            .iter()
            .filter(|tp| !tp.filled)
            .map(|tp| order(tp.order_id.as_deref().unwrap(), OrderStatus::New, tp.quantity))
            .collect();
        orders.push(order("sl1", OrderStatus::Untriggered, dec!(1000)));
        orders
    }

    #[test]
    fn no_change_produces_no_events() {
        let monitor = with_order_ids(test_monitor());
        let orders = ladder_orders(&monitor);
        let events = classify(&monitor, &snapshot(dec!(1000), dec!(105)), &orders).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn tp1_fill_is_classified_once() {
        let mut monitor = with_order_ids(test_monitor());
        // TP1 (qty 850) vanished and the position shrank to match.
        let orders: Vec<OpenOrder> = ladder_orders(&monitor)
            .into_iter()
            .filter(|o| o.order_id != "tp1")
            .collect();
        let snap = snapshot(dec!(150), dec!(111));

        let events = classify(&monitor, &snap, &orders).unwrap();
        assert_eq!(
            events,
            vec![FillEvent::TakeProfitFilled {
                level: 1,
                qty: dec!(850),
                price: dec!(110),
            }]
        );

        let outcome = apply_events(&mut monitor, &events).unwrap();
        assert!(outcome.first_tp_hit);
        assert_eq!(monitor.remaining_size, dec!(150));
        assert_eq!(monitor.phase, Phase::ProfitTaking);

        // Idempotence: re-processing the identical snapshot yields nothing.
        let again = classify(&monitor, &snap, &orders).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn triggered_stop_is_not_a_fill() {
        let monitor = with_order_ids(test_monitor());
        let mut orders = ladder_orders(&monitor);
        for o in orders.iter_mut() {
            if o.order_id == "sl1" {
                o.status = OrderStatus::Triggered;
            }
        }
        // Position size unchanged; the stop armed but has not executed.
        let events = classify(&monitor, &snapshot(dec!(1000), dec!(94)), &orders).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn ambiguous_closure_is_position_closed() {
        let monitor = with_order_ids(test_monitor());
        // Both TP1 and the stop vanished in the same cycle, position flat.
        let orders: Vec<OpenOrder> = ladder_orders(&monitor)
            .into_iter()
            .filter(|o| o.order_id != "tp1" && o.order_id != "sl1")
            .collect();
        let events = classify(&monitor, &snapshot(dec!(0), dec!(100)), &orders).unwrap();
        assert_eq!(events, vec![FillEvent::PositionClosed]);
    }

    #[test]
    fn mark_price_attributes_vanished_tp_over_sl() {
        let monitor = with_order_ids(test_monitor());
        // TP1 and SL both gone, but a partial remainder survives and the
        // mark sits above TP1's price: the take-profit explains it.
        let orders: Vec<OpenOrder> = ladder_orders(&monitor)
            .into_iter()
            .filter(|o| o.order_id != "tp1" && o.order_id != "sl1")
            .collect();
        let events = classify(&monitor, &snapshot(dec!(150), dec!(112)), &orders).unwrap();
        assert_eq!(
            events,
            vec![FillEvent::TakeProfitFilled {
                level: 1,
                qty: dec!(850),
                price: dec!(110),
            }]
        );
    }

    #[test]
    fn wrong_account_snapshot_is_rejected() {
        let monitor = with_order_ids(test_monitor());
        let mut snap = snapshot(dec!(150), dec!(111));
        snap.account = Account::Mirror;
        let err = classify(&monitor, &snap, &[]).unwrap_err();
        assert!(matches!(err, LadderError::SnapshotMismatch { .. }));
    }

    #[test]
    fn limit_fill_confirmed_by_position_growth() {
        let mut monitor = Monitor::new(NewMonitor {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            account: Account::Main,
            intended_size: dec!(300),
            filled_size: dec!(100),
            entry_price: dec!(100),
            tp_prices: vec![dec!(110)],
            sl_price: dec!(95),
            limit_orders: vec![LimitEntry {
                order_id: "entry1".to_string(),
                price: dec!(99),
                quantity: dec!(200),
                filled: false,
            }],
            config: LadderConfig {
                tp_percentages: vec![dec!(100)],
                fee_rate: dec!(0.00055),
                qty_step: dec!(1),
            },
        })
        .unwrap();
        monitor.take_profits[0].order_id = Some("tp1".to_string());
        monitor.stop_loss.order_id = Some("sl1".to_string());

        // Entry order gone, position grew from 100 to 300.
        let orders = vec![
            order("tp1", OrderStatus::New, dec!(300)),
            order("sl1", OrderStatus::Untriggered, dec!(300)),
        ];
        let snap = snapshot(dec!(300), dec!(100));
        let events = classify(&monitor, &snap, &orders).unwrap();
        assert_eq!(
            events,
            vec![FillEvent::LimitFilled {
                order_id: "entry1".to_string(),
                price: dec!(99),
                qty: dec!(200),
            }]
        );

        let outcome = apply_events(&mut monitor, &events).unwrap();
        assert_eq!(outcome.entry_fills, 1);
        assert_eq!(monitor.phase, Phase::Monitoring);
        assert_eq!(monitor.remaining_size, dec!(300));

        // Second pass over the same snapshot: nothing new.
        assert!(classify(&monitor, &snap, &orders).unwrap().is_empty());
    }

    #[test]
    fn vanished_entry_without_growth_stays_pending() {
        let monitor = {
            let mut m = Monitor::new(NewMonitor {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                account: Account::Main,
                intended_size: dec!(300),
                filled_size: dec!(100),
                entry_price: dec!(100),
                tp_prices: vec![dec!(110)],
                sl_price: dec!(95),
                limit_orders: vec![LimitEntry {
                    order_id: "entry1".to_string(),
                    price: dec!(99),
                    quantity: dec!(200),
                    filled: false,
                }],
                config: LadderConfig {
                    tp_percentages: vec![dec!(100)],
                    fee_rate: dec!(0.00055),
                    qty_step: dec!(1),
                },
            })
            .unwrap();
            m.take_profits[0].order_id = Some("tp1".to_string());
            m.stop_loss.order_id = Some("sl1".to_string());
            m
        };

        // Entry vanished but the position did not grow: no classification.
        let orders = vec![
            order("tp1", OrderStatus::New, dec!(300)),
            order("sl1", OrderStatus::Untriggered, dec!(300)),
        ];
        let events = classify(&monitor, &snapshot(dec!(100), dec!(100)), &orders).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn stop_loss_fill_closes_the_monitor() {
        let mut monitor = with_order_ids(test_monitor());
        let orders: Vec<OpenOrder> = ladder_orders(&monitor)
            .into_iter()
            .filter(|o| o.order_id != "sl1")
            .collect();
        let events = classify(&monitor, &snapshot(dec!(0), dec!(94)), &orders).unwrap();
        assert_eq!(
            events,
            vec![FillEvent::StopLossFilled {
                qty: dec!(1000),
                price: dec!(95),
            }]
        );
        let outcome = apply_events(&mut monitor, &events).unwrap();
        assert!(outcome.closed);
        assert_eq!(monitor.phase, Phase::Closed);
        assert_eq!(monitor.remaining_size, dec!(0));
    }

    #[test]
    fn filled_levels_never_shrink_across_passes() {
        let mut monitor = with_order_ids(test_monitor());

        let orders1: Vec<OpenOrder> = ladder_orders(&monitor)
            .into_iter()
            .filter(|o| o.order_id != "tp1")
            .collect();
        let events = classify(&monitor, &snapshot(dec!(150), dec!(111)), &orders1).unwrap();
        apply_events(&mut monitor, &events).unwrap();
        assert_eq!(monitor.filled_tp_levels, vec![1]);

        let orders2: Vec<OpenOrder> = orders1
            .into_iter()
            .filter(|o| o.order_id != "tp2")
            .collect();
        let events = classify(&monitor, &snapshot(dec!(100), dec!(121)), &orders2).unwrap();
        apply_events(&mut monitor, &events).unwrap();
        assert_eq!(monitor.filled_tp_levels, vec![1, 2]);
    }
}
