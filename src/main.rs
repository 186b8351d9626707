// src/main.rs - Service binary: load the YAML config, wire the stores and
// raisers, run the event loop until interrupted.

use siren::{
    AlarmService, AlarmState, AlarmStore, Config, JsonlStore, LogBroadcaster, MemoryStore,
    OutputCoordinator, Result, SensorPort,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Sensor stub for installations without a wired input bus; readings arrive
/// only through remote alerts and operator commands.
struct UnwiredSensor;

impl SensorPort for UnwiredSensor {
    fn request_status(&self) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("siren=info")),
        )
        .init();

    info!("Siren alarm service v{} starting", siren::VERSION);

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "siren.yaml".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config from {}: {}", config_path, e);
            return Err(e);
        }
    };
    info!(
        alarms = config.alarms.len(),
        config = %config_path,
        "configuration loaded"
    );

    let store: Arc<dyn AlarmStore<AlarmState>> = match &config.log_file {
        Some(path) => {
            info!(path = %path, "logging alarm changes to file");
            Arc::new(JsonlStore::open(path, config.alarms.clone()).await?)
        }
        None => Arc::new(MemoryStore::new(config.alarms.clone())),
    };

    let service = AlarmService::new(
        config,
        OutputCoordinator::new(),
        store,
        Arc::new(LogBroadcaster),
    );
    service.install_alarms(|_| Arc::new(UnwiredSensor))?;

    tokio::select! {
        result = Arc::clone(&service).run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
