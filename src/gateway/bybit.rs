use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bybit::auth::BybitAuth;
use crate::bybit::{parse_decimal, Account, OrderEntry, PositionEntry, Side};
use crate::error::{LadderError, Result};

use super::{ExchangeGateway, OpenOrder, OrderRequest, OrderType, PositionSnapshot, SymbolCooldown};

const DEFAULT_RECV_WINDOW: u64 = 5000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 250;

/// Bybit v5 REST gateway for a single account.
pub struct BybitGateway {
    client: Client,
    auth: Option<BybitAuth>,
    rest_url: String,
    account: Account,
    recv_window: u64,
    max_retries: u32,
    retry_base: Duration,
    cooldown: SymbolCooldown,
}

impl BybitGateway {
    pub fn new(
        rest_url: String,
        auth: Option<BybitAuth>,
        account: Account,
        cooldown_window: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            auth,
            rest_url,
            account,
            recv_window: DEFAULT_RECV_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            cooldown: SymbolCooldown::new(cooldown_window),
        }
    }

    pub fn cooldown(&self) -> &SymbolCooldown {
        &self.cooldown
    }

    /// Retry a read-only call with exponential backoff on transient errors.
    /// Mutations never go through here — their outcome after a timeout is
    /// unknown, and the next reconciliation pass resolves it.
    async fn with_read_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = self.retry_base;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(
                        "⚠️  {} failed on {} (attempt {}/{}): {} — retrying in {:?}",
                        what, self.account, attempt, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn signed_get(&self, path: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.rest_url, path);
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let mut request = self.client.get(&url).query(query);

        if let Some(auth) = &self.auth {
            let timestamp = chrono::Utc::now().timestamp_millis() as u64;
            let sign = auth
                .generate_signature(timestamp, &format!("{}{}", self.recv_window, &query_string));
            request = request
                .header("X-BAPI-API-KEY", auth.get_api_key())
                .header("X-BAPI-SIGN", sign)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let body: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        check_ret_code(&body)?;
        Ok(body)
    }

    async fn signed_post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.rest_url, path);
        let body_str = body.to_string();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body_str.clone());

        if let Some(auth) = &self.auth {
            let timestamp = chrono::Utc::now().timestamp_millis() as u64;
            let sign =
                auth.generate_signature(timestamp, &format!("{}{}", self.recv_window, &body_str));
            request = request
                .header("X-BAPI-API-KEY", auth.get_api_key())
                .header("X-BAPI-SIGN", sign)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let resp_json: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        check_ret_code(&resp_json)?;
        Ok(resp_json)
    }
}

#[async_trait]
impl ExchangeGateway for BybitGateway {
    fn account(&self) -> Account {
        self.account
    }

    async fn get_position(&self, symbol: &str, side: Side) -> Result<Option<PositionSnapshot>> {
        let params = [("category", "linear"), ("symbol", symbol)];
        let body = self
            .with_read_retry("get_position", || {
                self.signed_get("/v5/position/list", &params)
            })
            .await?;

        let entries: Vec<PositionEntry> =
            serde_json::from_value(body["result"]["list"].clone()).unwrap_or_default();

        for entry in entries {
            if entry.side != side.as_str() {
                continue;
            }
            let size = parse_decimal(&entry.size).unwrap_or(Decimal::ZERO);
            if size <= Decimal::ZERO {
                continue;
            }
            return Ok(Some(PositionSnapshot {
                account: self.account,
                symbol: entry.symbol,
                side,
                size,
                avg_price: parse_decimal(&entry.avg_price).unwrap_or(Decimal::ZERO),
                mark_price: parse_decimal(&entry.mark_price).unwrap_or(Decimal::ZERO),
            }));
        }

        Ok(None)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let params = [("category", "linear"), ("symbol", symbol)];
        let body = self
            .with_read_retry("get_open_orders", || {
                self.signed_get("/v5/order/realtime", &params)
            })
            .await?;

        let entries: Vec<OrderEntry> =
            serde_json::from_value(body["result"]["list"].clone()).unwrap_or_default();

        let mut orders = Vec::with_capacity(entries.len());
        for entry in entries {
            let status = match entry.order_status.parse() {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        "Unknown order status '{}' on {} for order {} — skipping",
                        entry.order_status, self.account, entry.order_id
                    );
                    continue;
                }
            };
            let side = match entry.side.as_str() {
                "Buy" => Side::Buy,
                "Sell" => Side::Sell,
                other => {
                    warn!("Unknown order side '{}' for order {}", other, entry.order_id);
                    continue;
                }
            };
            let order_type = if entry.order_type == "Market" {
                OrderType::Market
            } else {
                OrderType::Limit
            };
            let qty = match parse_decimal(&entry.qty) {
                Some(qty) => qty,
                None => continue,
            };
            orders.push(OpenOrder {
                order_id: entry.order_id,
                symbol: entry.symbol,
                side,
                order_type,
                price: parse_decimal(&entry.price),
                trigger_price: parse_decimal(&entry.trigger_price),
                qty,
                status,
                reduce_only: entry.reduce_only,
            });
        }

        Ok(orders)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        let mut body = json!({
            "category": "linear",
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type.as_str(),
            "qty": request.qty.to_string(),
            "reduceOnly": request.reduce_only,
        });

        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(trigger) = request.trigger_price {
            body["triggerPrice"] = json!(trigger.to_string());
            // Trigger direction: 1 = rises to trigger, 2 = falls to trigger.
            let falls = request.side == Side::Sell;
            body["triggerDirection"] = json!(if falls { 2 } else { 1 });
        }

        let resp = self.signed_post("/v5/order/create", body).await?;
        let order_id = resp["result"]["orderId"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if !request.reduce_only {
            self.cooldown.touch(&request.symbol);
        }

        debug!(
            "📤 {} order placed on {}: {} {} qty {} (id {})",
            request.order_type.as_str(),
            self.account,
            request.symbol,
            request.side,
            request.qty,
            order_id
        );

        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });

        self.signed_post("/v5/order/cancel", body).await.map(|_| ())
    }

    async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        qty: Option<Decimal>,
        price: Option<Decimal>,
    ) -> Result<()> {
        let mut body = json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        if let Some(qty) = qty {
            body["qty"] = json!(qty.to_string());
        }
        if let Some(price) = price {
            body["triggerPrice"] = json!(price.to_string());
        }

        self.signed_post("/v5/order/amend", body).await.map(|_| ())
    }
}

fn classify_reqwest(e: reqwest::Error) -> LadderError {
    if e.is_timeout() {
        LadderError::Timeout(e.to_string())
    } else {
        LadderError::Http(e)
    }
}

fn check_ret_code(body: &serde_json::Value) -> Result<()> {
    let ret_code = body["retCode"].as_i64().unwrap_or(-1);
    if ret_code == 0 {
        return Ok(());
    }
    let message = body["retMsg"].as_str().unwrap_or("Unknown error").to_string();
    match ret_code {
        110001 => Err(LadderError::OrderNotFound(message)),
        10006 => Err(LadderError::RateLimited(message)),
        code => Err(LadderError::Exchange { code, message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_code_zero_is_ok() {
        let body = json!({"retCode": 0, "retMsg": "OK"});
        assert!(check_ret_code(&body).is_ok());
    }

    #[test]
    fn missing_order_maps_to_order_not_found() {
        let body = json!({"retCode": 110001, "retMsg": "order not exists or too late to cancel"});
        let err = check_ret_code(&body).unwrap_err();
        assert!(matches!(err, LadderError::OrderNotFound(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn rejected_request_is_not_transient() {
        let body = json!({"retCode": 110007, "retMsg": "insufficient available balance"});
        let err = check_ret_code(&body).unwrap_err();
        assert!(!err.is_transient());
    }
}
