use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pmocache::{Cache, CacheManager, RendererRegistry};
use pmoconfig::Config;
use pmodisplay::{DisplayClient, DisplayController, DisplayManager, LoggingDisplayDevice};
use pmosched::{ContextConstraintsParser, SchedulingManager, TriggerCell};
use pmosensors::SensorManager;
use pmostore::ContextStore;
use pmosubs::{HandlerBinaries, SubscriptionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ========== PHASE 1 : configuration and stores ==========

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::builtin()?,
    };

    let context_store = ContextStore::open(&config.context_store.context_store_path)?;
    let registry = Arc::new(RendererRegistry::from_config(&config));
    let cache = Cache::new(config.cache_file_storage.cache_location.clone());
    let cache_manager = CacheManager::new(cache.clone(), Arc::clone(&registry));

    // ========== PHASE 2 : display side ==========

    info!("🖥️  Starting display controller...");
    let display_timeout = Duration::from_secs(config.display_device.display_timeout_secs()?);
    let mut display_controller =
        DisplayController::new(Arc::new(LoggingDisplayDevice), display_timeout);
    display_controller.start().await?;

    let trigger = TriggerCell::new();
    let renderer_starter = vec!["pmosignage-renderer".to_string()];
    let display_manager = DisplayManager::new(
        Arc::clone(&registry),
        cache.clone(),
        Arc::clone(&trigger) as _,
        renderer_starter,
    );

    // ========== PHASE 3 : scheduler ==========

    info!("🗓️  Starting scheduling manager...");
    let scheduler = SchedulingManager::new(
        &config,
        context_store.clone(),
        cache.clone(),
        Arc::clone(&registry),
        cache_manager,
        display_manager,
        DisplayClient::new(),
    );
    trigger.set(scheduler.clone());
    scheduler.start().await?;

    let mut context_parser = ContextConstraintsParser::new(scheduler.clone(), context_store);
    context_parser.start().await?;

    // ========== PHASE 4 : feeds and sensors ==========

    info!("📡 Starting subscription manager...");
    let subscription_manager =
        SubscriptionManager::new(&config, HandlerBinaries::beside_current_exe())?;
    subscription_manager.start().await?;

    info!("🔔 Starting sensor manager...");
    let sensor_manager = SensorManager::new();
    if let Err(e) = sensor_manager.start().await {
        warn!("⚠️ sensor manager failed to start: {e}");
    }

    info!("✅ PMOSignage is ready!");
    info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;

    // ========== PHASE 5 : shutdown, feeds first ==========

    info!("Stopping managers...");
    sensor_manager.stop().await;
    subscription_manager.stop().await;
    context_parser.stop().await;
    scheduler.stop().await;
    display_controller.stop().await;

    // Let detached renderer-stop tasks finish before the process goes.
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("✅ PMOSignage stopped");
    Ok(())
}
