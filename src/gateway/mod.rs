pub mod bybit;

pub use bybit::BybitGateway;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::bybit::{Account, OrderStatus, Side};
use crate::error::Result;

/// Account-tagged position snapshot. The tag lets the reconciliation engine
/// reject snapshots that were fetched for the wrong account.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub account: Account,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub mark_price: Decimal,
}

impl PositionSnapshot {
    /// Snapshot for a symbol with no open position.
    pub fn flat(account: Account, symbol: &str, side: Side) -> Self {
        Self {
            account,
            symbol: symbol.to_string(),
            side,
            size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
        }
    }
}

/// An order as reported by the exchange. The open-orders query may include
/// recently closed orders, so terminal statuses appear here too.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub qty: Decimal,
    pub status: OrderStatus,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    /// Conditional trigger price (stop-loss orders).
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
}

/// Narrow boundary to one exchange account. One instance per account —
/// credentials are never shared across accounts, and every response is
/// tagged with the account it came from.
///
/// Mutating calls are deliberately single-shot: a timeout is an unknown
/// outcome, and the caller re-queries state on the next poll cycle instead
/// of assuming success or failure.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn account(&self) -> Account;

    async fn get_position(&self, symbol: &str, side: Side) -> Result<Option<PositionSnapshot>>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    /// Returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        qty: Option<Decimal>,
        price: Option<Decimal>,
    ) -> Result<()>;
}

/// Bounded, time-windowed cache of recently traded symbols. Owned by the
/// gateway layer; entries expire after the window and the map is pruned on
/// every insert so it cannot grow without bound.
pub struct SymbolCooldown {
    window: Duration,
    entries: RwLock<HashMap<String, Instant>>,
}

impl SymbolCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a trade on the symbol, pruning expired entries.
    pub fn touch(&self, symbol: &str) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, at| now.duration_since(*at) < self.window);
        entries.insert(symbol.to_string(), now);
    }

    /// Whether the symbol was traded within the window.
    pub fn is_cooling(&self, symbol: &str) -> bool {
        let entries = self.entries.read();
        entries
            .get(symbol)
            .map(|at| at.elapsed() < self.window)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_tracks_recent_symbols() {
        let cooldown = SymbolCooldown::new(Duration::from_secs(60));
        assert!(!cooldown.is_cooling("BTCUSDT"));
        cooldown.touch("BTCUSDT");
        assert!(cooldown.is_cooling("BTCUSDT"));
        assert!(!cooldown.is_cooling("ETHUSDT"));
    }

    #[test]
    fn cooldown_expires_after_window() {
        let cooldown = SymbolCooldown::new(Duration::from_millis(0));
        cooldown.touch("BTCUSDT");
        assert!(!cooldown.is_cooling("BTCUSDT"));
    }

    #[test]
    fn cooldown_prunes_expired_entries_on_touch() {
        let cooldown = SymbolCooldown::new(Duration::from_millis(0));
        cooldown.touch("BTCUSDT");
        cooldown.touch("ETHUSDT");
        assert_eq!(cooldown.entries.read().len(), 1);
    }
}
