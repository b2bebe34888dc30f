//! syncsrv entry point

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::{init_with_config, shutdown_on_signal, LogConfig, ServiceArgs};
use syncsrv::config::{load_equipment_dir, EquipmentConfig};
use syncsrv::device::DeviceClientOptions;
use syncsrv::engine::{initialize_simulator, SimulationSetup};
use syncsrv::simulator::BoptestClient;
use syncsrv::{EquipmentManager, Settings, SyncEngine, SERVICE_NAME, SERVICE_VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse();

    let settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;

    let _log_guard = init_with_config(LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level: args.effective_log_level(&settings.logging.level),
        log_dir: settings.logging.dir.clone(),
        file_name: settings.logging.file.clone(),
        enable_json: settings.logging.json,
        ansi: !args.no_color,
    })
    .context("Failed to initialize logging")?;

    info!("Starting {} v{}", SERVICE_NAME, SERVICE_VERSION);
    settings.validate().context("Invalid settings")?;

    let equipment = load_equipment(&settings)?;

    if args.validate {
        let points: usize = equipment.iter().map(|e| e.points.len()).sum();
        info!(
            "Configuration OK: {} equipment units, {} points, unit system {:?}",
            equipment.len(),
            points,
            settings.unit_system
        );
        return Ok(());
    }

    // Simulator setup: test case, initialization, step time
    let mut simulator =
        BoptestClient::new(&settings.simulator).context("Failed to create simulator client")?;
    if let Some(testcase) = &settings.simulator.testcase {
        simulator
            .select_test_case(testcase)
            .await
            .with_context(|| format!("Failed to select test case {}", testcase))?;
    }
    // One instant for both the simulation start and the device clocks
    let epoch = settings.clock_epoch()?;
    let setup = SimulationSetup::from_settings(&settings, epoch);
    let metadata = initialize_simulator(&simulator, setup)
        .await
        .context("Failed to initialize simulator")?;

    // Devices
    let mut manager = EquipmentManager::new(
        DeviceClientOptions::from(&settings.device),
        settings.unit_system,
    );
    let report = manager.load_equipment(&equipment).await;
    info!(
        "Loaded {} units: {} points, {} resolved, {} failures, {} deferred",
        report.units,
        report.points,
        report.resolved,
        report.failures.len(),
        report.deferred.len()
    );
    for failure in &report.failures {
        warn!(
            "{}{}: {}",
            failure.equipment,
            failure.point.as_deref().map(|p| format!("/{}", p)).unwrap_or_default(),
            failure.reason
        );
    }

    if let Some(timezone) = &settings.timezone {
        for (host, result) in manager.synchronize_time_and_timezone(epoch, timezone).await {
            if result.is_ok() {
                info!("{}: time synchronized", host);
            }
        }
    }

    let engine = SyncEngine::new(
        Arc::new(simulator),
        Arc::new(manager),
        metadata,
        settings.step_period(),
        settings.sync_interval(),
    )?;

    let token = CancellationToken::new();
    let signal_handle = shutdown_on_signal(token.clone());
    let shutdown = engine.run(token).await;
    signal_handle.abort();

    if !shutdown.is_clean() {
        error!(
            "{} pending writes were not delivered before shutdown",
            shutdown.unflushed.len()
        );
    }
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

/// Load every equipment file; a broken file is logged and skipped
fn load_equipment(settings: &Settings) -> Result<Vec<EquipmentConfig>> {
    let mut equipment = Vec::new();
    for (path, result) in load_equipment_dir(&settings.equipment_dir)? {
        match result {
            Ok(config) => equipment.push(config),
            Err(e) => error!("Skipping {}: {}", path.display(), e),
        }
    }
    if equipment.is_empty() {
        bail!(
            "No usable equipment configuration in {}",
            settings.equipment_dir.display()
        );
    }
    Ok(equipment)
}
