use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bybit::{Account, Side};
use crate::error::{LadderError, Result};
use crate::ladder;

/// Coarse lifecycle stage of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Entry limit orders still filling.
    Building,
    /// Fully entered, ladder live, no take-profit hit yet.
    Monitoring,
    /// First take-profit filled, stop moved to breakeven.
    ProfitTaking,
    /// Remaining size reached zero; the monitor is done.
    Closed,
}

/// One take-profit rung of the ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpLevel {
    /// Level number, 1..=N.
    pub level: u8,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Percentage of the position allocated to this level (0..=100).
    pub percentage: Decimal,
    /// Exchange order id once placed.
    pub order_id: Option<String>,
    pub filled: bool,
}

/// The single stop-loss protecting the position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_id: Option<String>,
}

/// A pending limit entry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitEntry {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled: bool,
}

/// Immutable per-monitor ladder configuration, supplied at creation and
/// validated before the monitor may enter the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    /// Percentage split across take-profit levels, e.g. [85, 5, 5, 5].
    pub tp_percentages: Vec<Decimal>,
    /// One-way taker fee rate, e.g. 0.00055.
    pub fee_rate: Decimal,
    /// Exchange quantity step for the symbol, e.g. 0.001.
    pub qty_step: Decimal,
}

impl LadderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tp_percentages.is_empty() {
            return Err(LadderError::InvalidConfig(
                "take-profit percentage ladder is empty".to_string(),
            ));
        }
        if self.tp_percentages.iter().any(|p| *p <= Decimal::ZERO) {
            return Err(LadderError::InvalidConfig(
                "take-profit percentages must be positive".to_string(),
            ));
        }
        let sum: Decimal = self.tp_percentages.iter().sum();
        if sum != Decimal::from(100) {
            return Err(LadderError::InvalidConfig(format!(
                "take-profit percentages must sum to 100, got {}",
                sum
            )));
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(LadderError::InvalidConfig(format!(
                "fee rate out of range: {}",
                self.fee_rate
            )));
        }
        if self.qty_step <= Decimal::ZERO {
            return Err(LadderError::InvalidConfig(format!(
                "quantity step must be positive: {}",
                self.qty_step
            )));
        }
        Ok(())
    }
}

/// Everything needed to construct a monitor. `filled_size` is the portion of
/// `intended_size` already open on the exchange; the rest must be covered by
/// pending limit entries.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub symbol: String,
    pub side: Side,
    pub account: Account,
    pub intended_size: Decimal,
    pub filled_size: Decimal,
    pub entry_price: Decimal,
    pub tp_prices: Vec<Decimal>,
    pub sl_price: Decimal,
    pub limit_orders: Vec<LimitEntry>,
    pub config: LadderConfig,
}

/// The per-(symbol, side, account) state record tracking a position's ladder
/// and milestone progress. One monitor exists per key; all mutation happens
/// under the registry's per-key lock, driven by the reconciliation engine and
/// the controllers it invokes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub symbol: String,
    pub side: Side,
    pub account: Account,

    /// Originally intended full size, including unfilled limit entries.
    pub position_size: Decimal,
    /// Current open size on the exchange.
    pub remaining_size: Decimal,
    /// Volume-weighted average entry price.
    pub entry_price: Decimal,

    pub take_profits: Vec<TpLevel>,
    pub stop_loss: StopLossOrder,
    pub limit_orders: Vec<LimitEntry>,

    pub phase: Phase,

    pub first_tp_hit: bool,
    pub sl_moved_to_breakeven: bool,
    pub limit_orders_cancelled: bool,
    /// Level numbers already completed; grows monotonically.
    pub filled_tp_levels: Vec<u8>,

    /// Breakeven transition fired but not yet confirmed on the exchange.
    /// While set, further take-profit order surgery is held back.
    pub breakeven_pending: bool,

    /// Excluded from automated ladder changes after an invariant violation.
    pub quarantined: bool,

    pub created_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    /// Monotonic total filled across all fill events; guards against
    /// double-processing a snapshot.
    pub cumulative_filled: Decimal,

    pub config: LadderConfig,
}

impl Monitor {
    /// Single construction path. Rejects invalid configuration so a
    /// half-initialized monitor can never enter the registry.
    pub fn new(params: NewMonitor) -> Result<Monitor> {
        params.config.validate()?;

        if params.tp_prices.len() != params.config.tp_percentages.len() {
            return Err(LadderError::InvalidConfig(format!(
                "{} take-profit prices for {} percentage levels",
                params.tp_prices.len(),
                params.config.tp_percentages.len()
            )));
        }
        if params.intended_size <= Decimal::ZERO {
            return Err(LadderError::InvalidConfig(format!(
                "intended size must be positive: {}",
                params.intended_size
            )));
        }
        if params.filled_size < Decimal::ZERO || params.filled_size > params.intended_size {
            return Err(LadderError::InvalidConfig(format!(
                "filled size {} outside 0..={}",
                params.filled_size, params.intended_size
            )));
        }
        let pending: Decimal = params.limit_orders.iter().filter(|o| !o.filled).map(|o| o.quantity).sum();
        if params.filled_size + pending != params.intended_size {
            return Err(LadderError::InvalidConfig(format!(
                "filled {} + pending entries {} must equal intended size {}",
                params.filled_size, pending, params.intended_size
            )));
        }

        let quantities = ladder::split_quantities(
            params.intended_size,
            &params.config.tp_percentages,
            params.config.qty_step,
        )?;

        let take_profits = params
            .tp_prices
            .iter()
            .zip(params.config.tp_percentages.iter())
            .zip(quantities.iter())
            .enumerate()
            .map(|(i, ((price, pct), qty))| TpLevel {
                level: (i + 1) as u8,
                price: *price,
                quantity: *qty,
                percentage: *pct,
                order_id: None,
                filled: false,
            })
            .collect();

        // Full intended coverage until the first take-profit fills.
        let stop_loss = StopLossOrder {
            price: params.sl_price,
            quantity: params.intended_size,
            order_id: None,
        };

        let phase = if params.filled_size == params.intended_size {
            Phase::Monitoring
        } else {
            Phase::Building
        };

        let now = Utc::now();
        Ok(Monitor {
            symbol: params.symbol,
            side: params.side,
            account: params.account,
            position_size: params.intended_size,
            remaining_size: params.filled_size,
            entry_price: params.entry_price,
            take_profits,
            stop_loss,
            limit_orders: params.limit_orders,
            phase,
            first_tp_hit: false,
            sl_moved_to_breakeven: false,
            limit_orders_cancelled: false,
            filled_tp_levels: Vec::new(),
            breakeven_pending: false,
            quarantined: false,
            created_at: now,
            last_checked_at: now,
            cumulative_filled: Decimal::ZERO,
            config: params.config,
        })
    }

    /// Registry key: `"{symbol}_{side}_{account}"`.
    pub fn key(&self) -> String {
        monitor_key(&self.symbol, self.side, self.account)
    }

    pub fn unfilled_tp_levels(&self) -> impl Iterator<Item = &TpLevel> {
        self.take_profits.iter().filter(|tp| !tp.filled)
    }

    pub fn pending_limit_orders(&self) -> impl Iterator<Item = &LimitEntry> {
        self.limit_orders.iter().filter(|o| !o.filled)
    }

    pub fn is_fully_entered(&self) -> bool {
        self.limit_orders.iter().all(|o| o.filled)
    }

    /// Fold an entry fill into the volume-weighted average entry price and
    /// the open size.
    pub fn absorb_entry_fill(&mut self, price: Decimal, qty: Decimal) {
        let new_size = self.remaining_size + qty;
        if new_size > Decimal::ZERO {
            self.entry_price =
                (self.entry_price * self.remaining_size + price * qty) / new_size;
        }
        self.remaining_size = new_size;
        self.cumulative_filled += qty;
    }

    /// Mark a take-profit level filled. Levels are never unmarked.
    pub fn mark_tp_filled(&mut self, level: u8, qty: Decimal) {
        if let Some(tp) = self.take_profits.iter_mut().find(|tp| tp.level == level) {
            tp.filled = true;
        }
        if !self.filled_tp_levels.contains(&level) {
            self.filled_tp_levels.push(level);
        }
        self.remaining_size -= qty;
        self.cumulative_filled += qty;
        if !self.first_tp_hit {
            self.first_tp_hit = true;
        }
        if self.phase == Phase::Monitoring || self.phase == Phase::Building {
            self.phase = Phase::ProfitTaking;
        }
    }

    pub fn mark_sl_filled(&mut self, qty: Decimal) {
        self.remaining_size -= qty;
        self.cumulative_filled += qty;
    }

    pub fn mark_closed(&mut self) {
        self.remaining_size = Decimal::ZERO;
        self.phase = Phase::Closed;
    }

    /// Check the structural invariants that reconciliation must preserve.
    /// A violation is a programming error; the caller quarantines the
    /// monitor rather than letting it corrupt the ladder further.
    pub fn check_invariants(&self) -> Result<()> {
        if self.remaining_size < Decimal::ZERO {
            return Err(LadderError::InvariantViolation {
                key: self.key(),
                reason: format!("negative remaining size {}", self.remaining_size),
            });
        }
        if self.remaining_size > self.position_size {
            return Err(LadderError::InvariantViolation {
                key: self.key(),
                reason: format!(
                    "remaining size {} exceeds intended size {}",
                    self.remaining_size, self.position_size
                ),
            });
        }
        Ok(())
    }

    pub fn quarantine(&mut self, reason: &str) {
        tracing::error!(
            "🚨 Quarantining monitor {} — {}; ladder frozen pending manual intervention",
            self.key(),
            reason
        );
        self.quarantined = true;
    }
}

pub fn monitor_key(symbol: &str, side: Side, account: Account) -> String {
    format!("{}_{}_{}", symbol, side, account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ladder_config() -> LadderConfig {
        LadderConfig {
            tp_percentages: vec![dec!(85), dec!(5), dec!(5), dec!(5)],
            fee_rate: dec!(0.00055),
            qty_step: dec!(1),
        }
    }

    fn base_monitor() -> NewMonitor {
        NewMonitor {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            account: Account::Main,
            intended_size: dec!(1000),
            filled_size: dec!(1000),
            entry_price: dec!(100),
            tp_prices: vec![dec!(110), dec!(120), dec!(130), dec!(140)],
            sl_price: dec!(95),
            limit_orders: vec![],
            config: ladder_config(),
        }
    }

    #[test]
    fn builds_ladder_from_intended_size() {
        let monitor = Monitor::new(base_monitor()).unwrap();
        let quantities: Vec<Decimal> =
            monitor.take_profits.iter().map(|tp| tp.quantity).collect();
        assert_eq!(quantities, vec![dec!(850), dec!(50), dec!(50), dec!(50)]);
        assert_eq!(monitor.stop_loss.quantity, dec!(1000));
        assert_eq!(monitor.phase, Phase::Monitoring);
    }

    #[test]
    fn partial_entry_starts_building() {
        let mut s = base_monitor();
        s.filled_size = dec!(400);
        s.limit_orders = vec![LimitEntry {
            order_id: "e1".to_string(),
            price: dec!(99),
            quantity: dec!(600),
            filled: false,
        }];
        let monitor = Monitor::new(s).unwrap();
        assert_eq!(monitor.phase, Phase::Building);
        // Stop covers the full intended size, not just what has filled.
        assert_eq!(monitor.stop_loss.quantity, dec!(1000));
    }

    #[test]
    fn rejects_percentages_not_summing_to_100() {
        let mut s = base_monitor();
        s.config.tp_percentages = vec![dec!(85), dec!(5), dec!(5)];
        s.tp_prices = vec![dec!(110), dec!(120), dec!(130)];
        assert!(matches!(
            Monitor::new(s),
            Err(LadderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_mismatched_entry_quantities() {
        let mut s = base_monitor();
        s.filled_size = dec!(400);
        // No pending entries to cover the other 600.
        assert!(Monitor::new(s).is_err());
    }

    #[test]
    fn vwap_entry_price_update() {
        let mut s = base_monitor();
        s.filled_size = dec!(500);
        s.limit_orders = vec![LimitEntry {
            order_id: "e1".to_string(),
            price: dec!(90),
            quantity: dec!(500),
            filled: false,
        }];
        let mut monitor = Monitor::new(s).unwrap();
        monitor.absorb_entry_fill(dec!(90), dec!(500));
        assert_eq!(monitor.entry_price, dec!(95));
        assert_eq!(monitor.remaining_size, dec!(1000));
    }

    #[test]
    fn filled_levels_grow_monotonically() {
        let mut monitor = Monitor::new(base_monitor()).unwrap();
        monitor.mark_tp_filled(1, dec!(850));
        monitor.mark_tp_filled(1, dec!(0)); // duplicate mark is a no-op
        assert_eq!(monitor.filled_tp_levels, vec![1]);
        assert_eq!(monitor.phase, Phase::ProfitTaking);
        assert!(monitor.first_tp_hit);
    }

    #[test]
    fn negative_remaining_is_an_invariant_violation() {
        let mut monitor = Monitor::new(base_monitor()).unwrap();
        monitor.mark_sl_filled(dec!(1500));
        assert!(monitor.check_invariants().is_err());
    }

    #[test]
    fn key_format() {
        let monitor = Monitor::new(base_monitor()).unwrap();
        assert_eq!(monitor.key(), "BTCUSDT_Buy_main");
    }
}
