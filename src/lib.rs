pub mod config;
pub mod error;
pub mod bybit;
pub mod gateway;
pub mod monitor;
pub mod reconcile;
pub mod ladder;
pub mod breakeven;
pub mod mirror;
pub mod registry;
pub mod events;
pub mod poller;

pub use config::Config;
pub use bybit::{Account, BybitAuth, Side};
pub use error::{LadderError, Result};
pub use registry::MonitorRegistry;
