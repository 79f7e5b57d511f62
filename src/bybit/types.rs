use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which exchange account a monitor, gateway or snapshot belongs to.
/// Credentials and snapshots are partitioned per account and never crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Account {
    Main,
    Mirror,
}

impl Account {
    pub fn as_str(&self) -> &'static str {
        match self {
            Account::Main => "main",
            Account::Mirror => "mirror",
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Account {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(Account::Main),
            "mirror" => Ok(Account::Mirror),
            _ => Err("invalid account; expected main|mirror"),
        }
    }
}

/// Position direction, matching Bybit's capitalized wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// The side a reduce-only exit order must be placed on.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bybit v5 order status. Triggered means the conditional order has armed
/// but has NOT executed yet; it must never be treated as a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Untriggered,
    Triggered,
    Filled,
    Cancelled,
    Deactivated,
    Rejected,
}

impl OrderStatus {
    /// Live orders still occupy their ladder slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::PartiallyFilled
                | OrderStatus::Untriggered
                | OrderStatus::Triggered
        )
    }
}

impl FromStr for OrderStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "New" => Ok(OrderStatus::New),
            "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
            "Untriggered" => Ok(OrderStatus::Untriggered),
            "Triggered" => Ok(OrderStatus::Triggered),
            "Filled" => Ok(OrderStatus::Filled),
            "Cancelled" => Ok(OrderStatus::Cancelled),
            "Deactivated" => Ok(OrderStatus::Deactivated),
            "Rejected" => Ok(OrderStatus::Rejected),
            _ => Err("unknown order status"),
        }
    }
}

/// Position entry from `/v5/position/list`. Bybit encodes all numbers as
/// strings on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionEntry {
    pub symbol: String,

    pub side: String,

    pub size: String,

    #[serde(rename = "avgPrice")]
    pub avg_price: String,

    #[serde(rename = "markPrice")]
    pub mark_price: String,
}

/// Order entry from `/v5/order/realtime`. The endpoint returns open orders
/// plus recently closed ones, so terminal statuses can appear here.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderEntry {
    #[serde(rename = "orderId")]
    pub order_id: String,

    pub symbol: String,

    pub side: String,

    #[serde(rename = "orderType")]
    pub order_type: String,

    pub qty: String,

    pub price: String,

    #[serde(rename = "triggerPrice", default)]
    pub trigger_price: String,

    #[serde(rename = "orderStatus")]
    pub order_status: String,

    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
}

/// Parse one of Bybit's string-encoded decimals; empty strings mean "absent".
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw).ok()
}
