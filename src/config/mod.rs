use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::monitor::LadderConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bybit: BybitConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub ladder: LadderSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BybitConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub testnet: bool,
    pub rest_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    #[serde(default = "default_mirror_rest_url")]
    pub rest_url: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_secret: None,
            rest_url: default_mirror_rest_url(),
        }
    }
}

fn default_mirror_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    pub symbol: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_symbol_cooldown_secs")]
    pub symbol_cooldown_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_symbol_cooldown_secs() -> u64 {
    300
}

/// Percentage ladder and fee schedule applied to every new monitor.
/// Percentages are whole numbers; decimal-valued rates come in as strings so
/// no float ever touches quantity arithmetic.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LadderSettings {
    #[serde(default = "default_tp_percentages")]
    pub tp_percentages: Vec<u32>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: String,
    #[serde(default = "default_qty_step")]
    pub qty_step: String,
}

impl Default for LadderSettings {
    fn default() -> Self {
        Self {
            tp_percentages: default_tp_percentages(),
            fee_rate: default_fee_rate(),
            qty_step: default_qty_step(),
        }
    }
}

fn default_tp_percentages() -> Vec<u32> {
    vec![85, 5, 5, 5]
}
fn default_fee_rate() -> String {
    "0.00055".to_string()
}
fn default_qty_step() -> String {
    "0.001".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_checkpoint_path(),
            debounce_secs: default_debounce_secs(),
        }
    }
}

fn default_checkpoint_path() -> String {
    "data/monitors.json".to_string()
}
fn default_debounce_secs() -> u64 {
    3
}

impl Config {
    pub fn load() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("BOT").separator("_"));

        // Load API keys from environment
        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            builder = builder.set_override("bybit.api_key", api_key)?;
        }
        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            builder = builder.set_override("bybit.api_secret", api_secret)?;
        }
        if let Ok(api_key) = std::env::var("BYBIT_MIRROR_API_KEY") {
            builder = builder.set_override("mirror.api_key", api_key)?;
        }
        if let Ok(api_secret) = std::env::var("BYBIT_MIRROR_API_SECRET") {
            builder = builder.set_override("mirror.api_secret", api_secret)?;
        }

        let config = builder.build()?;
        let config: Config = config.try_deserialize()?;
        config.ladder_config()?; // fail fast on an invalid ladder
        Ok(Arc::new(config))
    }

    /// Parse and validate the per-monitor ladder configuration. Called at
    /// load time so a bad ladder can never reach a live monitor.
    pub fn ladder_config(&self) -> Result<LadderConfig> {
        let ladder = LadderConfig {
            tp_percentages: self
                .ladder
                .tp_percentages
                .iter()
                .map(|p| Decimal::from(*p))
                .collect(),
            fee_rate: Decimal::from_str(&self.ladder.fee_rate)
                .map_err(|e| anyhow::anyhow!("invalid fee_rate '{}': {}", self.ladder.fee_rate, e))?,
            qty_step: Decimal::from_str(&self.ladder.qty_step)
                .map_err(|e| anyhow::anyhow!("invalid qty_step '{}': {}", self.ladder.qty_step, e))?,
        };
        ladder.validate()?;
        Ok(ladder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> Config {
        Config {
            bybit: BybitConfig {
                api_key: None,
                api_secret: None,
                testnet: true,
                rest_url: "https://api-testnet.bybit.com".to_string(),
            },
            mirror: MirrorConfig::default(),
            trading: TradingConfig {
                symbol: "BTCUSDT".to_string(),
                poll_interval_secs: 5,
                symbol_cooldown_secs: 300,
            },
            ladder: LadderSettings::default(),
            persistence: PersistenceConfig::default(),
        }
    }

    #[test]
    fn default_ladder_parses_and_validates() {
        let ladder = base_config().ladder_config().unwrap();
        assert_eq!(
            ladder.tp_percentages,
            vec![dec!(85), dec!(5), dec!(5), dec!(5)]
        );
        assert_eq!(ladder.fee_rate, dec!(0.00055));
        assert_eq!(ladder.qty_step, dec!(0.001));
    }

    #[test]
    fn bad_percentage_sum_fails_fast() {
        let mut config = base_config();
        config.ladder.tp_percentages = vec![85, 5, 5];
        assert!(config.ladder_config().is_err());
    }

    #[test]
    fn unparsable_fee_rate_fails_fast() {
        let mut config = base_config();
        config.ladder.fee_rate = "a lot".to_string();
        assert!(config.ladder_config().is_err());
    }
}
