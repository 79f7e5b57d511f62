use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bybit_ladder_bot::bybit::auth::BybitAuth;
use bybit_ladder_bot::bybit::Account;
use bybit_ladder_bot::config::Config;
use bybit_ladder_bot::events::EventBus;
use bybit_ladder_bot::gateway::BybitGateway;
use bybit_ladder_bot::poller::{Gateways, PollSupervisor};
use bybit_ladder_bot::registry::{Checkpointer, MonitorRegistry};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("🚀 Bybit TP/SL Ladder Bot - Starting...");

    // Load configuration
    let config = Config::load()?;
    info!("✅ Configuration loaded");
    info!("   Symbol: {}", config.trading.symbol);
    info!("   Testnet: {}", config.bybit.testnet);
    info!("   Mirror account: {}", config.mirror.enabled);
    info!("   Poll interval: {}s", config.trading.poll_interval_secs);

    let cooldown = Duration::from_secs(config.trading.symbol_cooldown_secs);

    // Main account gateway
    let main_auth = match (&config.bybit.api_key, &config.bybit.api_secret) {
        (Some(key), Some(secret)) if !key.is_empty() => {
            Some(BybitAuth::new(key.clone(), secret.clone()))
        }
        _ => None,
    };
    let main_gateway = Arc::new(BybitGateway::new(
        config.bybit.rest_url.clone(),
        main_auth,
        Account::Main,
        cooldown,
    ));
    info!("✅ Main gateway initialized");

    // Mirror account gateway (optional)
    let mirror_gateway = if config.mirror.enabled {
        match (&config.mirror.api_key, &config.mirror.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() => {
                info!("✅ Mirror gateway initialized");
                Some(Arc::new(BybitGateway::new(
                    config.mirror.rest_url.clone(),
                    Some(BybitAuth::new(key.clone(), secret.clone())),
                    Account::Mirror,
                    cooldown,
                )) as Arc<dyn bybit_ladder_bot::gateway::ExchangeGateway>)
            }
            _ => {
                warn!("⚠️  Mirror account enabled but credentials missing — disabled");
                None
            }
        }
    } else {
        None
    };

    // Registry + persistence
    let registry = Arc::new(MonitorRegistry::new());
    let checkpoint_path = PathBuf::from(&config.persistence.checkpoint_path);
    if let Some(parent) = checkpoint_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let checkpointer = Arc::new(Checkpointer::new(
        checkpoint_path,
        Duration::from_secs(config.persistence.debounce_secs),
    ));

    // Rehydrate monitors from the last checkpoint
    if let Some(checkpoint) = checkpointer.load().await? {
        let restored = Checkpointer::rehydrate(&registry, checkpoint)?;
        info!("✅ Registry rehydrated: {} active monitors", restored);
    } else {
        info!("✅ Registry started empty (no checkpoint found)");
    }

    // Milestone event sink: log transitions; an external notifier can
    // subscribe to the same bus.
    let events = EventBus::default();
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("🔔 {:?}", event);
        }
    });

    let supervisor = Arc::new(PollSupervisor::new(
        registry.clone(),
        checkpointer.clone(),
        events,
        Gateways {
            main: main_gateway,
            mirror: mirror_gateway,
        },
        Duration::from_secs(config.trading.poll_interval_secs),
    ));

    // Rehydrated state is reconciled against fresh exchange snapshots
    // before the normal polling cadence begins.
    supervisor.startup_reconcile().await;

    let poll_task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };

    info!("✅ All tasks started");
    info!("📊 Monitoring {} position ladders...", registry.len());

    tokio::select! {
        result = poll_task => {
            if let Err(e) = result {
                warn!("Poll supervisor task error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Final checkpoint so no fill progress is lost across the restart
    if let Err(e) = checkpointer.flush(&registry).await {
        warn!("Failed to write final checkpoint: {}", e);
    }

    info!("👋 Bot stopped");
    Ok(())
}
