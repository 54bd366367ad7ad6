// src/main.rs
use anyhow::Result;
use log::{error, info};
use registry_watcher::config::{Config, DEFAULT_CONFIG_PATH};
use registry_watcher::modules::{LoggingConfigListener, LoggingServiceListener, WatchRegistry};
use registry_watcher::{ConsulClient, RegistryClient, SignalHandler};
use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger based on RUST_LOG env var, or default to info
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = env::args().nth(1).map(PathBuf::from);
    match &config_path {
        Some(path) => info!("Loading configuration from: {:?}", path),
        None => info!("Loading configuration from default path: {}", DEFAULT_CONFIG_PATH),
    }

    info!("registry watcher starting...");

    let config = match Config::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            exit(1);
        }
    };

    let client: Arc<dyn RegistryClient> = match ConsulClient::from_config(&config.registry) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create registry client: {}", e);
            exit(1);
        }
    };

    let mut watches = WatchRegistry::new(client, &config.trigger);
    if let Err(e) = register_watches(&config, &mut watches) {
        error!("Failed to register watches: {:#}", e);
        exit(1);
    }

    if config.one_shot {
        info!("One-shot mode enabled. Checking every watch once.");
        watches.check_all_once().await;
        return Ok(());
    }

    if let Err(e) = watches.start_all() {
        error!("Failed to start watches: {}", e);
        exit(1);
    }

    let signal_handler = SignalHandler::new(CancellationToken::new());
    if let Err(e) = signal_handler.install() {
        error!("Failed to install signal handler: {}", e);
        watches.stop_all().await;
        exit(1);
    }

    signal_handler.wait().await;
    info!("Shutting down {} watch(es)", watches.count());
    watches.stop_all().await;
    signal_handler.uninstall();
    info!("registry watcher stopped");
    Ok(())
}

fn register_watches(config: &Config, watches: &mut WatchRegistry) -> Result<()> {
    for watch in &config.kv_watches {
        let path = watch.config_path()?.compose_path();
        let key = watches.add_config_watch(
            Arc::new(LoggingConfigListener::new(path)),
            watch.interval(),
        )?;
        info!("Watching {} every {:?}", key, watch.interval());
    }
    for watch in &config.service_watches {
        let key = watches.add_service_watch(
            Arc::new(LoggingServiceListener::new(watch.service_key.clone())),
            watch.interval(),
        )?;
        info!("Watching {} every {:?}", key, watch.interval());
    }
    Ok(())
}
