use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::bybit::{Account, Side};

/// Milestone events emitted for external alerting. The core never formats or
/// sends user-facing messages; a notifier subscribes to this bus and renders
/// what it wants.
#[derive(Debug, Clone, Serialize)]
pub enum MonitorEvent {
    LimitFilled {
        symbol: String,
        side: Side,
        order_id: String,
        qty: Decimal,
    },
    TakeProfitFilled {
        symbol: String,
        side: Side,
        level: u8,
        qty: Decimal,
        price: Decimal,
    },
    StopLossFilled {
        symbol: String,
        side: Side,
        qty: Decimal,
        price: Decimal,
    },
    BreakevenApplied {
        symbol: String,
        side: Side,
        breakeven_price: Decimal,
    },
    LimitOrdersCancelled {
        symbol: String,
        side: Side,
        cancelled: usize,
    },
    PositionClosed {
        symbol: String,
        side: Side,
    },
    MonitorQuarantined {
        symbol: String,
        side: Side,
        account: Account,
        reason: String,
    },
}

/// Broadcast bus for milestone events. Publishing with no subscribers is
/// fine — events are advisory, not load-bearing.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(MonitorEvent::PositionClosed {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, MonitorEvent::PositionClosed { .. }));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(MonitorEvent::BreakevenApplied {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            breakeven_price: dec!(100),
        });
    }
}
