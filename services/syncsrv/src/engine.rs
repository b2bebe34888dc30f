//! Sync engine: the simulation cycle and the device cycle
//!
//! Both loops run concurrently on their own interval and share state only
//! through the [`EquipmentManager`]. Cancellation is observed between
//! iterations, so an advance or a device batch already underway runs to
//! completion (or its request timeout) before the loop exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use errors::{SyncError, SyncResult};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::equipment::{EquipmentManager, UnflushedWrite};
use crate::settings::Settings;
use crate::simulator::{MetadataMap, SimulatorClient};

/// Simulator start-up parameters
#[derive(Debug, Clone, Copy)]
pub struct SimulationSetup {
    /// Unix seconds
    pub start_time: f64,
    pub warmup_period: f64,
    pub step: f64,
}

impl SimulationSetup {
    /// Setup starting at `epoch`, the same instant pushed to device clocks
    pub fn from_settings(settings: &Settings, epoch: i64) -> Self {
        Self {
            start_time: epoch as f64,
            warmup_period: settings.simulator.warmup_period_secs,
            step: settings.simulator.step_secs,
        }
    }
}

/// Initialize the simulator and fetch signal metadata
pub async fn initialize_simulator<S>(simulator: &S, setup: SimulationSetup) -> SyncResult<MetadataMap>
where
    S: SimulatorClient + ?Sized,
{
    simulator
        .initialize(setup.start_time, setup.warmup_period)
        .await?;
    simulator.set_step_time(setup.step).await?;
    let metadata = simulator.get_metadata().await?;
    if metadata.is_empty() {
        warn!("Simulator returned no signal metadata; unit conversion relies on configured units");
    }
    Ok(metadata)
}

/// Terminal status of a run
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub steps: u64,
    pub failed_steps: u64,
    pub device_cycles: u64,
    /// Pending values that never reached their device, one report each
    pub unflushed: Vec<UnflushedWrite>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unflushed.is_empty()
    }
}

/// Runs the two cycles until cancelled
pub struct SyncEngine {
    simulator: Arc<dyn SimulatorClient>,
    manager: Arc<EquipmentManager>,
    metadata: Arc<MetadataMap>,
    step_period: Duration,
    sync_interval: Duration,
}

impl SyncEngine {
    pub fn new(
        simulator: Arc<dyn SimulatorClient>,
        manager: Arc<EquipmentManager>,
        metadata: MetadataMap,
        step_period: Duration,
        sync_interval: Duration,
    ) -> SyncResult<Self> {
        if step_period.is_zero() || sync_interval.is_zero() {
            return Err(SyncError::Config(
                "step period and sync interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            simulator,
            manager,
            metadata: Arc::new(metadata),
            step_period,
            sync_interval,
        })
    }

    /// Run both cycles until `token` is cancelled, then report
    pub async fn run(&self, token: CancellationToken) -> ShutdownReport {
        info!(
            "Sync engine started: step {:?}, device sync {:?}",
            self.step_period, self.sync_interval
        );

        let ((steps, failed_steps), device_cycles) =
            tokio::join!(self.simulation_loop(&token), self.device_loop(&token));

        let unflushed = self.manager.report_unflushed();
        for write in &unflushed {
            error!(
                "Unflushed write {}/{} = {} ({})",
                write.equipment,
                write.device_name,
                write.value,
                write.last_failure.as_deref().unwrap_or("never attempted")
            );
        }
        info!(
            "Sync engine stopped: {} steps ({} failed), {} device cycles, {} unflushed writes",
            steps,
            failed_steps,
            device_cycles,
            unflushed.len()
        );

        ShutdownReport {
            steps,
            failed_steps,
            device_cycles,
            unflushed,
        }
    }

    async fn simulation_loop(&self, token: &CancellationToken) -> (u64, u64) {
        let mut interval = time::interval(self.step_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (mut steps, mut failed) = (0u64, 0u64);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {},
            }

            let started = Instant::now();
            match self.step().await {
                Ok(()) => steps += 1,
                Err(e) => {
                    failed += 1;
                    error!("Simulation step failed, retrying next tick: {}", e);
                },
            }
            let elapsed = started.elapsed();
            if elapsed > self.step_period {
                warn!(
                    "Simulation step took {:?}, longer than the {:?} period",
                    elapsed, self.step_period
                );
            }
        }
        (steps, failed)
    }

    /// One simulation step: advance with device feedback, merge KPIs and
    /// route the outputs to the points
    async fn step(&self) -> SyncResult<()> {
        let control_inputs = self.manager.collect_control_inputs();
        let mut outputs = self.simulator.advance(&control_inputs).await?;

        match self.simulator.get_kpis().await {
            Ok(kpis) => outputs.extend(kpis),
            Err(e) => warn!("KPI fetch failed; continuing with measurements only: {}", e),
        }

        let summary = self.manager.apply_simulator_outputs(&outputs, &self.metadata);
        debug!(
            "Step: {} control inputs, {} outputs, {} pending, {} unchanged, {} dropped",
            control_inputs.len(),
            outputs.len(),
            summary.pending,
            summary.unchanged,
            summary.dropped
        );
        Ok(())
    }

    async fn device_loop(&self, token: &CancellationToken) -> u64 {
        let mut interval = time::interval(self.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {},
            }

            let summary = self.manager.sync_devices().await;
            cycles += 1;
            if summary.failed_devices() > 0 || summary.point_failures() > 0 {
                warn!("Device cycle {}: {}", cycles, summary);
            } else {
                debug!("Device cycle {}: {}", cycles, summary);
            }
        }
        cycles
    }
}
