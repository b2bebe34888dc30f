//! Equipment manager
//!
//! Owns every equipment unit (one device client plus its points) and fans the
//! per-cycle work out across devices. Each unit's points sit behind one
//! `parking_lot` mutex that is only held for in-memory bookkeeping, never
//! across a network call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use errors::{ClassifiedError, SyncError, SyncResult};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EquipmentConfig;
use crate::device::{
    BatchResult, DeviceClient, DeviceClientOptions, EndpointIndex, ObjectRef, ReadOp, WriteOp,
};
use crate::point::{Point, PointValue, ProcessOutcome};
use crate::simulator::{MetadataMap, SignalMap};
use crate::units::UnitSystem;

// ============================================================================
// Reports
// ============================================================================

/// Something that went wrong while loading one unit or one of its points
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub equipment: String,
    /// `None` when the failure concerns the whole unit
    pub point: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub units: usize,
    pub points: usize,
    pub resolved: usize,
    pub failures: Vec<LoadFailure>,
    /// Units whose device was unreachable; discovery is retried each cycle
    pub deferred: Vec<String>,
}

/// Result of routing one set of simulator outputs onto the points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub pending: usize,
    pub unchanged: usize,
    pub dropped: usize,
}

/// Per-point outcome of one device cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    Written(PointValue),
    Read(PointValue),
    WriteFailed(String),
    ReadFailed(String),
    /// Write held back because the out-of-service assertion failed
    Blocked(String),
    /// Device does not expose the object
    Unresolved(String),
}

impl PointOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PointOutcome::WriteFailed(_)
                | PointOutcome::ReadFailed(_)
                | PointOutcome::Blocked(_)
                | PointOutcome::Unresolved(_)
        )
    }
}

/// What one device did in one cycle
#[derive(Debug, Clone)]
pub struct DeviceCycleReport {
    pub equipment: String,
    pub host: String,
    pub outcomes: Vec<(String, PointOutcome)>,
    /// Cycle-level failure (discovery, authentication, whole batch)
    pub error: Option<String>,
}

impl DeviceCycleReport {
    fn new(unit: &EquipmentUnit) -> Self {
        Self {
            equipment: unit.name.clone(),
            host: unit.client.host().to_string(),
            outcomes: Vec::new(),
            error: None,
        }
    }

    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PointOutcome::Written(_)))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PointOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_failure())
            .map(|(name, o)| (name.as_str(), o))
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of one device-sync cycle across all units
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub devices: Vec<DeviceCycleReport>,
}

impl CycleSummary {
    pub fn failed_devices(&self) -> usize {
        self.devices.iter().filter(|d| !d.is_ok()).count()
    }

    pub fn point_failures(&self) -> usize {
        self.devices.iter().map(|d| d.failures().count()).sum()
    }

    pub fn writes(&self) -> usize {
        self.devices.iter().map(DeviceCycleReport::written).sum()
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} devices ({} failed), {} writes, {} point failures",
            self.devices.len(),
            self.failed_devices(),
            self.writes(),
            self.point_failures()
        )
    }
}

/// A pending value that never reached its device
#[derive(Debug, Clone, PartialEq)]
pub struct UnflushedWrite {
    pub equipment: String,
    pub device_name: String,
    pub value: PointValue,
    pub last_failure: Option<String>,
}

// ============================================================================
// Equipment unit
// ============================================================================

#[derive(Debug)]
struct UnitState {
    points: Vec<Point>,
    /// `None` until discovery succeeds, and again after a not-found reply
    index: Option<EndpointIndex>,
}

/// One device client and the points mapped onto it
#[derive(Debug)]
pub struct EquipmentUnit {
    name: String,
    client: Arc<DeviceClient>,
    state: Mutex<UnitState>,
}

impl EquipmentUnit {
    pub fn new(name: impl Into<String>, client: Arc<DeviceClient>, points: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            client,
            state: Mutex::new(UnitState {
                points,
                index: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point(&self, device_name: &str) -> Option<Point> {
        self.state
            .lock()
            .points
            .iter()
            .find(|p| p.device_name() == device_name)
            .cloned()
    }

    fn needs_discovery(&self) -> bool {
        let state = self.state.lock();
        state.index.is_none() || state.points.iter().any(Point::needs_resolution)
    }

    /// Enumerate the device and resolve every point still waiting for an
    /// identity; returns per-point resolution failures
    async fn discover(&self) -> SyncResult<Vec<(String, SyncError)>> {
        let index = self.client.discover_endpoints().await?;
        Ok(self.apply_index(&index))
    }

    /// Resolve unbound points against a freshly enumerated index
    fn apply_index(&self, index: &EndpointIndex) -> Vec<(String, SyncError)> {
        let mut state = self.state.lock();
        let mut failures = Vec::new();
        for point in state.points.iter_mut().filter(|p| p.needs_resolution()) {
            match point.resolve_identity(index) {
                Ok(instance) => debug!(
                    "{}: {} {} -> instance {}",
                    self.name,
                    point.object_type(),
                    point.device_name(),
                    instance
                ),
                Err(e) => {
                    warn!("{}: {}", self.name, e);
                    failures.push((point.device_name().to_string(), e));
                },
            }
        }
        state.index = Some(index.clone());
        failures
    }

    fn resolved_count(&self) -> usize {
        self.state
            .lock()
            .points
            .iter()
            .filter(|p| p.instance().is_some())
            .count()
    }

    fn apply_outputs(&self, outputs: &SignalMap, metadata: &MetadataMap) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let mut state = self.state.lock();
        for point in state.points.iter_mut() {
            let raw = match outputs.get(point.simulator_name()) {
                Some(raw) => *raw,
                // Activation points fire every step whether or not the
                // simulator reports them
                None if point.is_activation() => f64::NAN,
                None => continue,
            };
            match point.process_bop_value(raw, metadata.get(point.simulator_name())) {
                ProcessOutcome::Pending(_) => summary.pending += 1,
                ProcessOutcome::Unchanged(_) => summary.unchanged += 1,
                ProcessOutcome::Dropped(reason) => {
                    warn!(
                        "{}: dropped {} for {}: {}",
                        self.name,
                        point.simulator_name(),
                        point.device_name(),
                        reason
                    );
                    summary.dropped += 1;
                },
            }
        }
        summary
    }

    /// Objects owed an out-of-service assertion under session `version`
    fn owed_out_of_service(&self, version: u64) -> Vec<(String, ObjectRef)> {
        let state = self.state.lock();
        state
            .points
            .iter()
            .filter(|p| p.pending_write().is_some() && p.needs_out_of_service(version))
            .filter_map(|p| {
                p.write_op()
                    .map(|(op, _)| (p.device_name().to_string(), op.object))
            })
            .collect()
    }

    fn mark_out_of_service(&self, device_name: &str, version: u64) {
        let mut state = self.state.lock();
        if let Some(point) = state.points.iter_mut().find(|p| p.device_name() == device_name) {
            point.mark_out_of_service(version);
        }
    }

    /// Reads and writes due this cycle; writes in `blocked` are held back
    /// and recorded as failed
    fn batch_ops(&self, blocked: &HashMap<String, String>) -> (Vec<ReadOp>, Vec<(WriteOp, u64)>) {
        let mut state = self.state.lock();
        let mut writes = Vec::new();
        for point in state.points.iter_mut() {
            let Some((op, generation)) = point.write_op() else {
                continue;
            };
            if let Some(reason) = blocked.get(point.device_name()) {
                point.apply_write_failure(reason.clone());
                continue;
            }
            writes.push((op, generation));
        }
        let reads = state.points.iter().filter_map(Point::read_op).collect();
        (reads, writes)
    }

    /// Record `reason` against every value still waiting to be written
    fn fail_pending_writes(&self, reason: &str) {
        let mut state = self.state.lock();
        for point in state.points.iter_mut().filter(|p| p.pending_write().is_some()) {
            point.apply_write_failure(reason);
        }
    }

    /// Fold this unit's share of a device batch back into its points
    fn apply_batch_result(
        &self,
        reads: &[ReadOp],
        writes: &[(WriteOp, u64)],
        result: &BatchResult,
        report: &mut DeviceCycleReport,
    ) {
        let mut state = self.state.lock();
        let mut invalidated = false;
        for (op, generation) in writes {
            let Some(point) = state.points.iter_mut().find(|p| p.device_name() == op.key) else {
                continue;
            };
            match result.writes.get(&op.key) {
                Some(Ok(())) => {
                    point.apply_write_success(op.value, *generation);
                    report
                        .outcomes
                        .push((op.key.clone(), PointOutcome::Written(op.value)));
                },
                Some(Err(failure)) => {
                    if failure.is_not_found() {
                        point.invalidate_identity();
                        point.clear_feedback();
                        invalidated = true;
                    }
                    point.apply_write_failure(failure.to_string());
                    report
                        .outcomes
                        .push((op.key.clone(), PointOutcome::WriteFailed(failure.to_string())));
                },
                None => {
                    point.apply_write_failure("missing from batch result");
                    report.outcomes.push((
                        op.key.clone(),
                        PointOutcome::WriteFailed("missing from batch result".to_string()),
                    ));
                },
            }
        }
        for read in reads {
            let Some(point) = state.points.iter_mut().find(|p| p.device_name() == read.key) else {
                continue;
            };
            match result.reads.get(&read.key) {
                Some(Ok(raw)) => match point.apply_read(raw) {
                    Some(value) => report.outcomes.push((read.key.clone(), PointOutcome::Read(value))),
                    None => report.outcomes.push((
                        read.key.clone(),
                        PointOutcome::ReadFailed(format!("undecodable value {}", raw)),
                    )),
                },
                Some(Err(failure)) => {
                    if failure.is_not_found() {
                        point.invalidate_identity();
                        point.clear_feedback();
                        invalidated = true;
                    }
                    report
                        .outcomes
                        .push((read.key.clone(), PointOutcome::ReadFailed(failure.to_string())));
                },
                None => report.outcomes.push((
                    read.key.clone(),
                    PointOutcome::ReadFailed("missing from batch result".to_string()),
                )),
            }
        }
        if invalidated {
            // Refresh the index next cycle
            state.index = None;
        }
    }
}

// ============================================================================
// Device cycle
// ============================================================================

/// Mark every unit of a device as failed for this cycle
fn fail_device(
    units: &[&EquipmentUnit],
    mut reports: Vec<DeviceCycleReport>,
    reason: String,
) -> Vec<DeviceCycleReport> {
    for (unit, report) in units.iter().zip(reports.iter_mut()) {
        unit.fail_pending_writes(&reason);
        report.error = Some(reason.clone());
    }
    reports
}

/// One device cycle for every unit mapped onto `client`
///
/// Discovery runs once for the device, out-of-service assertions are made
/// for all of its units, and every pending read and write goes out in a
/// single batch. Results are handed back to the owning units.
async fn sync_device(client: &DeviceClient, units: &[&EquipmentUnit]) -> Vec<DeviceCycleReport> {
    let mut reports: Vec<DeviceCycleReport> = units.iter().map(|u| DeviceCycleReport::new(u)).collect();

    if units.iter().any(|u| u.needs_discovery()) {
        match client.discover_endpoints().await {
            Ok(index) => {
                for (unit, report) in units.iter().zip(reports.iter_mut()) {
                    if !unit.needs_discovery() {
                        continue;
                    }
                    for (name, e) in unit.apply_index(&index) {
                        report.outcomes.push((name, PointOutcome::Unresolved(e.to_string())));
                    }
                }
            },
            Err(e) => return fail_device(units, reports, format!("discovery failed: {}", e)),
        }
    }

    let session = match client.session().await {
        Ok(session) => session,
        Err(e) => return fail_device(units, reports, e.to_string()),
    };

    let mut blocked: Vec<HashMap<String, String>> = vec![HashMap::new(); units.len()];
    for (pos, unit) in units.iter().enumerate() {
        for (name, object) in unit.owed_out_of_service(session.version()) {
            match client.set_out_of_service(object, true).await {
                Ok(version) => unit.mark_out_of_service(&name, version),
                Err(e) if e.is_device_fatal() => {
                    let reason = format!("out-of-service for {} failed: {}", name, e);
                    return fail_device(units, reports, reason);
                },
                Err(e) => {
                    warn!("{}: out-of-service for {} failed: {}", unit.name, name, e);
                    blocked[pos].insert(name, e.to_string());
                },
            }
        }
    }

    let mut shares = Vec::with_capacity(units.len());
    for ((unit, blocked), report) in units.iter().zip(blocked).zip(reports.iter_mut()) {
        shares.push(unit.batch_ops(&blocked));
        for (name, reason) in blocked {
            report.outcomes.push((name, PointOutcome::Blocked(reason)));
        }
    }
    let reads: Vec<ReadOp> = shares.iter().flat_map(|(r, _)| r.iter().cloned()).collect();
    let writes: Vec<WriteOp> = shares
        .iter()
        .flat_map(|(_, w)| w.iter().map(|(op, _)| op.clone()))
        .collect();

    let result = match client.send_batch(&reads, &writes).await {
        Ok(result) => result,
        Err(e) => return fail_device(units, reports, format!("batch failed: {}", e)),
    };

    for ((unit, (reads, writes)), report) in units.iter().zip(&shares).zip(reports.iter_mut()) {
        unit.apply_batch_result(reads, writes, &result, report);
    }
    reports
}

// ============================================================================
// Equipment manager
// ============================================================================

/// Owns all equipment units and the device clients they share
pub struct EquipmentManager {
    options: DeviceClientOptions,
    unit_system: UnitSystem,
    units: Vec<EquipmentUnit>,
    /// One client per device address, shared by units on the same device
    clients: HashMap<String, Arc<DeviceClient>>,
}

impl EquipmentManager {
    pub fn new(options: DeviceClientOptions, unit_system: UnitSystem) -> Self {
        Self {
            options,
            unit_system,
            units: Vec::new(),
            clients: HashMap::new(),
        }
    }

    pub fn units(&self) -> &[EquipmentUnit] {
        &self.units
    }

    pub fn unit(&self, name: &str) -> Option<&EquipmentUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    fn client_for(&mut self, host: &str) -> SyncResult<Arc<DeviceClient>> {
        if let Some(client) = self.clients.get(host) {
            return Ok(client.clone());
        }
        let client = Arc::new(DeviceClient::new(host, &self.options)?);
        self.clients.insert(host.to_string(), client.clone());
        Ok(client)
    }

    /// Build units from configuration, then discover every device and
    /// resolve its points
    ///
    /// Point construction and resolution failures are collected per point.
    /// A device that cannot be reached keeps its unit with unresolved points;
    /// discovery is retried by the device cycle.
    pub async fn load_equipment(&mut self, configs: &[EquipmentConfig]) -> LoadReport {
        let mut report = LoadReport::default();
        let first_new = self.units.len();

        // Device object names already claimed, per device
        let mut claimed: HashMap<String, HashSet<String>> = HashMap::new();
        for unit in &self.units {
            let names = claimed.entry(unit.client.host().to_string()).or_default();
            names.extend(unit.state.lock().points.iter().map(|p| p.device_name().to_string()));
        }

        for config in configs {
            let host = config.device_ip.trim();
            let client = match self.client_for(host) {
                Ok(client) => client,
                Err(e) => {
                    error!("{}: {}", config.equipment_name, e);
                    report.failures.push(LoadFailure {
                        equipment: config.equipment_name.clone(),
                        point: None,
                        reason: e.to_string(),
                    });
                    continue;
                },
            };

            let names = claimed.entry(host.to_string()).or_default();
            let mut points = Vec::with_capacity(config.points.len());
            for point_config in &config.points {
                let point = if names.contains(&point_config.device_name) {
                    Err(SyncError::InvalidConfig {
                        field: point_config.device_name.clone(),
                        reason: format!("object already mapped on {}", host),
                    })
                } else {
                    Point::from_config(point_config, self.unit_system)
                };
                match point {
                    Ok(point) => {
                        names.insert(point_config.device_name.clone());
                        points.push(point);
                    },
                    Err(e) => {
                        error!(
                            "{}: point {} rejected: {}",
                            config.equipment_name, point_config.device_name, e
                        );
                        report.failures.push(LoadFailure {
                            equipment: config.equipment_name.clone(),
                            point: Some(point_config.device_name.clone()),
                            reason: e.to_string(),
                        });
                    },
                }
            }

            report.points += points.len();
            self.units
                .push(EquipmentUnit::new(config.equipment_name.clone(), client, points));
        }

        report.units = self.units.len() - first_new;
        let groups = group_by_device(self.units[first_new..].iter());
        let results = join_all(groups.into_iter().map(|(client, units)| async move {
            let discovered = client.discover_endpoints().await;
            (client, units, discovered)
        }))
        .await;

        for (client, units, discovered) in results {
            match discovered {
                Ok(index) => {
                    for unit in units {
                        for (name, e) in unit.apply_index(&index) {
                            report.failures.push(LoadFailure {
                                equipment: unit.name.clone(),
                                point: Some(name),
                                reason: e.to_string(),
                            });
                        }
                        let resolved = unit.resolved_count();
                        report.resolved += resolved;
                        info!(
                            "Initialized equipment '{}' on {}: {} points resolved",
                            unit.name,
                            client.host(),
                            resolved
                        );
                    }
                },
                Err(e) => {
                    for unit in units {
                        warn!(
                            "{}: discovery on {} failed ({}); retrying on the device cycle",
                            unit.name,
                            client.host(),
                            e
                        );
                        report.deferred.push(unit.name.clone());
                    }
                },
            }
        }

        report
    }

    /// Route simulator outputs to the points that own them
    pub fn apply_simulator_outputs(&self, outputs: &SignalMap, metadata: &MetadataMap) -> ApplySummary {
        let mut total = ApplySummary::default();
        for unit in &self.units {
            let summary = unit.apply_outputs(outputs, metadata);
            total.pending += summary.pending;
            total.unchanged += summary.unchanged;
            total.dropped += summary.dropped;
        }
        total
    }

    /// Points with a pending write or a read-back due, grouped by device
    pub fn pending_points_by_device(&self) -> BTreeMap<String, Vec<Point>> {
        let mut grouped: BTreeMap<String, Vec<Point>> = BTreeMap::new();
        for (client, units) in group_by_device(self.units.iter()) {
            let due: Vec<Point> = units
                .iter()
                .flat_map(|unit| {
                    let state = unit.state.lock();
                    state
                        .points
                        .iter()
                        .filter(|p| p.pending_write().is_some() || p.is_read_target())
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect();
            if !due.is_empty() {
                grouped.insert(client.host().to_string(), due);
            }
        }
        grouped
    }

    /// Device feedback to send with the next simulator advance
    pub fn collect_control_inputs(&self) -> SignalMap {
        let mut inputs = SignalMap::new();
        for unit in &self.units {
            let state = unit.state.lock();
            for point in &state.points {
                inputs.extend(point.feedback());
            }
        }
        inputs
    }

    /// Run one device cycle on every device concurrently
    ///
    /// Units sharing a device are synced together in one batch. A device
    /// with nothing due and no discovery owed is left alone. Devices are
    /// isolated from each other: a failure is recorded in the reports of
    /// that device's units and the others complete normally.
    pub async fn sync_devices(&self) -> CycleSummary {
        let due = self.pending_points_by_device();
        let groups: Vec<_> = group_by_device(self.units.iter())
            .into_iter()
            .filter(|(client, units)| {
                due.contains_key(client.host()) || units.iter().any(|u| u.needs_discovery())
            })
            .collect();

        let devices: Vec<DeviceCycleReport> =
            join_all(groups.iter().map(|(client, units)| sync_device(client, units)))
                .await
                .into_iter()
                .flatten()
                .collect();
        for device in &devices {
            if let Some(e) = &device.error {
                error!("{} ({}): {}", device.equipment, device.host, e);
            }
            for (name, outcome) in device.failures() {
                warn!("{}: {} {:?}", device.equipment, name, outcome);
            }
        }
        CycleSummary { devices }
    }

    /// Push the simulation clock and timezone to every device
    ///
    /// NTP is disabled first so the device does not immediately overwrite
    /// the pushed time; a device where that fails is skipped.
    pub async fn synchronize_time_and_timezone(
        &self,
        epoch_seconds: i64,
        timezone: &str,
    ) -> Vec<(String, SyncResult<()>)> {
        info!("Synchronizing time and timezone ({}) on {} devices", timezone, self.clients.len());
        let mut clients: Vec<&Arc<DeviceClient>> = self.clients.values().collect();
        clients.sort_by(|a, b| a.host().cmp(b.host()));

        join_all(clients.into_iter().map(|client| async move {
            let result = async {
                client.disable_ntp().await?;
                client.set_time_and_timezone(timezone, epoch_seconds).await
            }
            .await;
            if let Err(e) = &result {
                error!("{}: time sync failed ({}): {}", client.host(), e.error_code(), e);
            }
            (client.host().to_string(), result)
        }))
        .await
    }

    /// Retry resolution for every point of `equipment` that is not bound,
    /// including points previously reported missing; returns how many
    /// points are resolved afterwards
    pub async fn re_resolve(&self, equipment: &str) -> SyncResult<usize> {
        let unit = self.unit(equipment).ok_or_else(|| {
            SyncError::Config(format!("unknown equipment '{}'", equipment))
        })?;
        {
            let mut state = unit.state.lock();
            for point in state.points.iter_mut() {
                point.reset_resolution();
            }
        }
        unit.discover().await?;
        let resolved = unit.resolved_count();
        info!("{}: {} points resolved after re-resolution", equipment, resolved);
        Ok(resolved)
    }

    /// Every pending value that has not been written
    pub fn report_unflushed(&self) -> Vec<UnflushedWrite> {
        let mut unflushed = Vec::new();
        for unit in &self.units {
            let state = unit.state.lock();
            for point in &state.points {
                if let Some(value) = point.pending_write() {
                    unflushed.push(UnflushedWrite {
                        equipment: unit.name.clone(),
                        device_name: point.device_name().to_string(),
                        value,
                        last_failure: point.last_failure().map(str::to_string),
                    });
                }
            }
        }
        unflushed
    }
}

/// Units grouped by the device client they share, in load order
fn group_by_device<'a>(
    units: impl Iterator<Item = &'a EquipmentUnit>,
) -> Vec<(&'a Arc<DeviceClient>, Vec<&'a EquipmentUnit>)> {
    let mut groups: Vec<(&Arc<DeviceClient>, Vec<&EquipmentUnit>)> = Vec::new();
    for unit in units {
        match groups.iter_mut().find(|(client, _)| Arc::ptr_eq(client, &unit.client)) {
            Some((_, members)) => members.push(unit),
            None => groups.push((&unit.client, vec![unit])),
        }
    }
    groups
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::PointConfig;
    use crate::device::RetryPolicy;
    use crate::point::ObjectType;
    use crate::simulator::SignalMetadata;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn options() -> DeviceClientOptions {
        DeviceClientOptions {
            username: "admin".into(),
            password: "secret".into(),
            scheme: "http".into(),
            accept_invalid_certs: false,
            request_timeout: Duration::from_millis(200),
            retry: RetryPolicy::once(),
            auth_retry: RetryPolicy::once(),
        }
    }

    fn point_config(sim: &str, dev: &str, object_type: ObjectType) -> PointConfig {
        PointConfig {
            simulator_name: sim.to_string(),
            device_name: dev.to_string(),
            object_type,
            unit: None,
            si_unit: None,
            us_unit: None,
            convert_to_us: false,
            priority: None,
            threshold: None,
            override_point: None,
            activate: false,
        }
    }

    fn manager_with(points: Vec<PointConfig>) -> EquipmentManager {
        let mut manager = EquipmentManager::new(options(), UnitSystem::Si);
        let client = manager.client_for("127.0.0.1:9").unwrap();
        let points = points
            .iter()
            .map(|c| Point::from_config(c, UnitSystem::Si).unwrap())
            .collect();
        manager.units.push(EquipmentUnit::new("AHU-1", client, points));
        manager
    }

    #[test]
    fn test_outputs_routed_by_simulator_name() {
        let mut activation = point_config("oveFan_activate", "FanEnable", ObjectType::BinaryValue);
        activation.activate = true;
        let manager = manager_with(vec![
            point_config("TSup", "SupplyTemp", ObjectType::AnalogValue),
            point_config("TRet", "ReturnTemp", ObjectType::AnalogValue),
            activation,
        ]);

        let outputs: SignalMap = [("TSup".to_string(), 291.0), ("unmapped".to_string(), 1.0)]
            .into_iter()
            .collect();
        let summary = manager.apply_simulator_outputs(&outputs, &MetadataMap::new());
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.dropped, 0);

        let unit = manager.unit("AHU-1").unwrap();
        assert_eq!(unit.point("SupplyTemp").unwrap().pending_write(), Some(PointValue::Analog(291.0)));
        assert_eq!(unit.point("ReturnTemp").unwrap().pending_write(), None);
        assert_eq!(unit.point("FanEnable").unwrap().pending_write(), Some(PointValue::Binary(true)));
    }

    #[test]
    #[traced_test]
    fn test_dropped_values_are_counted() {
        let manager = manager_with(vec![point_config("u", "DamperCmd", ObjectType::BinaryOutput)]);
        let outputs: SignalMap = [("u".to_string(), 0.5)].into_iter().collect();
        let metadata: MetadataMap = [("u".to_string(), SignalMetadata::default())].into_iter().collect();
        let summary = manager.apply_simulator_outputs(&outputs, &metadata);
        assert_eq!(summary, ApplySummary { pending: 0, unchanged: 0, dropped: 1 });
        assert!(logs_contain("dropped u for DamperCmd"));
    }

    #[test]
    fn test_pending_points_grouped_by_device() {
        let manager = manager_with(vec![
            point_config("a", "A", ObjectType::AnalogValue),
            point_config("b", "B", ObjectType::AnalogOutput),
            point_config("c", "C", ObjectType::AnalogValue),
        ]);
        let outputs: SignalMap = [("a".to_string(), 1.0)].into_iter().collect();
        manager.apply_simulator_outputs(&outputs, &MetadataMap::new());

        let grouped = manager.pending_points_by_device();
        let names: Vec<&str> = grouped["127.0.0.1:9"].iter().map(|p| p.device_name()).collect();
        // A has a pending write, B is an output read back every cycle
        assert_eq!(names, vec!["A", "B"]);

        let unflushed = manager.report_unflushed();
        assert_eq!(unflushed.len(), 1);
        assert_eq!(unflushed[0].device_name, "A");
    }

    #[tokio::test]
    async fn test_unreachable_device_is_deferred() {
        let mut manager = EquipmentManager::new(options(), UnitSystem::Si);
        let config = EquipmentConfig {
            equipment_name: "AHU-9".to_string(),
            // Discard port; nothing listens there
            device_ip: "127.0.0.1:9".to_string(),
            points: vec![point_config("a", "A", ObjectType::AnalogValue)],
        };
        let report = manager.load_equipment(&[config]).await;
        assert_eq!(report.units, 1);
        assert_eq!(report.points, 1);
        assert_eq!(report.resolved, 0);
        assert_eq!(report.deferred, vec!["AHU-9".to_string()]);

        let summary = manager.sync_devices().await;
        assert_eq!(summary.failed_devices(), 1);
    }

    #[tokio::test]
    async fn test_object_names_unique_per_device() {
        let mut manager = EquipmentManager::new(options(), UnitSystem::Si);
        let ahu = EquipmentConfig {
            equipment_name: "AHU-1".to_string(),
            device_ip: "127.0.0.1:9".to_string(),
            points: vec![point_config("a", "Shared", ObjectType::AnalogValue)],
        };
        let vav = EquipmentConfig {
            equipment_name: "VAV-1".to_string(),
            device_ip: "127.0.0.1:9".to_string(),
            points: vec![
                point_config("b", "Shared", ObjectType::AnalogValue),
                point_config("c", "Own", ObjectType::AnalogValue),
            ],
        };
        let elsewhere = EquipmentConfig {
            equipment_name: "AHU-2".to_string(),
            device_ip: "127.0.0.1:10".to_string(),
            points: vec![point_config("d", "Shared", ObjectType::AnalogValue)],
        };
        let report = manager.load_equipment(&[ahu, vav, elsewhere]).await;

        assert_eq!(report.units, 3);
        assert_eq!(report.points, 3);
        let rejected: Vec<_> = report.failures.iter().filter(|f| f.point.is_some()).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].equipment, "VAV-1");
        assert_eq!(rejected[0].point.as_deref(), Some("Shared"));

        // Both units on 127.0.0.1:9 share one client and are discovered together
        let grouped = group_by_device(manager.units.iter());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1.len(), 2);
        assert!(manager.unit("VAV-1").unwrap().point("Shared").is_none());
    }
}
