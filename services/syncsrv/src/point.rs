//! Point model: one simulator signal mapped onto one device object
//!
//! The object-type set is fixed by the device protocol, so the per-type
//! encode/decode rules are plain `match`es over [`ObjectType`] rather than a
//! trait object hierarchy.

use std::fmt;
use std::str::FromStr;

use errors::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PointConfig;
use crate::device::{EndpointIndex, ObjectRef, ReadOp, WriteOp};
use crate::simulator::SignalMetadata;
use crate::units::{Unit, UnitSystem};

// ============================================================================
// Object types
// ============================================================================

/// Device object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum ObjectType {
    AnalogValue,
    AnalogInput,
    AnalogOutput,
    BinaryValue,
    BinaryInput,
    BinaryOutput,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::AnalogValue,
        ObjectType::AnalogInput,
        ObjectType::AnalogOutput,
        ObjectType::BinaryValue,
        ObjectType::BinaryInput,
        ObjectType::BinaryOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::AnalogValue => "AnalogValue",
            ObjectType::AnalogInput => "AnalogInput",
            ObjectType::AnalogOutput => "AnalogOutput",
            ObjectType::BinaryValue => "BinaryValue",
            ObjectType::BinaryInput => "BinaryInput",
            ObjectType::BinaryOutput => "BinaryOutput",
        }
    }

    /// Plural collection segment used in object URLs (`analog-inputs`)
    pub fn url_segment(&self) -> &'static str {
        match self {
            ObjectType::AnalogValue => "analog-values",
            ObjectType::AnalogInput => "analog-inputs",
            ObjectType::AnalogOutput => "analog-outputs",
            ObjectType::BinaryValue => "binary-values",
            ObjectType::BinaryInput => "binary-inputs",
            ObjectType::BinaryOutput => "binary-outputs",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ObjectType::BinaryValue | ObjectType::BinaryInput | ObjectType::BinaryOutput
        )
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ObjectType::AnalogOutput | ObjectType::BinaryOutput)
    }

    /// Hardware-bound objects (inputs and outputs) must be taken out of
    /// service before an external value sticks; value objects never do.
    pub fn requires_out_of_service(&self) -> bool {
        !matches!(self, ObjectType::AnalogValue | ObjectType::BinaryValue)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = SyncError;

    /// Accepts `AnalogInput`, `analog-input`, `analog_inputs`, `ANALOG INPUT`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized.strip_suffix('s').unwrap_or(&normalized);
        match normalized {
            "analogvalue" => Ok(ObjectType::AnalogValue),
            "analoginput" => Ok(ObjectType::AnalogInput),
            "analogoutput" => Ok(ObjectType::AnalogOutput),
            "binaryvalue" => Ok(ObjectType::BinaryValue),
            "binaryinput" => Ok(ObjectType::BinaryInput),
            "binaryoutput" => Ok(ObjectType::BinaryOutput),
            _ => Err(SyncError::InvalidConfig {
                field: "object_type".to_string(),
                reason: format!("unsupported object type '{}'", s),
            }),
        }
    }
}

impl TryFrom<String> for ObjectType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Values
// ============================================================================

/// Value in device-native representation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Analog(f64),
    Binary(bool),
}

impl PointValue {
    pub fn to_json(self) -> Value {
        match self {
            PointValue::Analog(v) => Value::from(v),
            PointValue::Binary(b) => Value::Bool(b),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            PointValue::Analog(v) => v,
            PointValue::Binary(b) => f64::from(u8::from(b)),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Analog(v) => write!(f, "{}", v),
            PointValue::Binary(b) => write!(f, "{}", if *b { "active" } else { "inactive" }),
        }
    }
}

/// Decode a device `present-value` for the given object type
///
/// Binary objects report booleans, `active`/`inactive` strings or numbers
/// depending on firmware; analog objects report numbers, occasionally as
/// strings.
pub fn decode_device_value(object_type: ObjectType, raw: &Value) -> Option<PointValue> {
    if object_type.is_binary() {
        let state = match raw {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "active" | "true" | "on" => Some(true),
                "inactive" | "false" | "off" => Some(false),
                other => other.parse::<f64>().ok().map(|v| v != 0.0),
            },
            _ => None,
        };
        state.map(PointValue::Binary)
    } else {
        let value = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        };
        value.filter(|v| v.is_finite()).map(PointValue::Analog)
    }
}

// ============================================================================
// Processing outcomes
// ============================================================================

/// Why a simulator sample was not turned into a device write
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DropReason {
    #[error("value is not finite: {0}")]
    NotFinite(f64),

    #[error("no source unit in configuration or simulator metadata")]
    MissingMetadata,

    #[error("unit conversion failed: {0}")]
    Conversion(String),

    #[error("value {0} is not a binary state (expected 0 or 1)")]
    NotBinary(f64),
}

/// Result of feeding one simulator sample into a point
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// New value stored as `pending_write`
    Pending(PointValue),
    /// Same value as already written or pending
    Unchanged(PointValue),
    /// Sample rejected; nothing changed
    Dropped(DropReason),
}

/// Identity resolution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Not looked up yet (or reset for manual re-resolution)
    Unresolved,
    /// Bound to a device instance number
    Resolved(u32),
    /// The device reported the object missing during a batch; looked up again
    /// automatically once the endpoint index is refreshed
    Stale,
    /// Device does not expose the object; excluded until reset
    Missing,
}

// ============================================================================
// Point
// ============================================================================

/// Runtime state for one mapped value pair
#[derive(Debug, Clone)]
pub struct Point {
    simulator_name: String,
    override_point: Option<String>,
    device_name: String,
    object_type: ObjectType,
    priority: Option<u8>,
    threshold: Option<f64>,
    activate: bool,
    source_unit: Option<Unit>,
    target_unit: Option<Unit>,
    resolution: Resolution,
    current_value: Option<PointValue>,
    pending_write: Option<PointValue>,
    /// Bumped every time `pending_write` changes; a flush only clears the
    /// pending value it actually sent
    pending_generation: u64,
    /// Session version the out-of-service assertion was made under
    out_of_service_session: Option<u64>,
    /// Most recent value read back from the device this cycle
    feedback_value: Option<PointValue>,
    last_failure: Option<String>,
}

impl Point {
    /// Build a point from its configuration
    ///
    /// Unit tags are validated here so a bad unit fails at construction
    /// rather than on every simulation step.
    pub fn from_config(config: &PointConfig, unit_system: UnitSystem) -> SyncResult<Self> {
        let object_type = config.object_type;

        if object_type.is_binary() && !object_type.is_output() && !config.activate {
            match config.threshold {
                Some(t) if t.is_finite() => {},
                _ => {
                    return Err(SyncError::InvalidConfig {
                        field: format!("{}.threshold", config.device_name),
                        reason: format!("a finite threshold is required for {}", object_type),
                    })
                },
            }
        }

        let source_unit = config.unit.as_deref().map(str::parse::<Unit>).transpose()?;
        if let Some(si) = config.si_unit.as_deref() {
            let si: Unit = si.parse()?;
            if let Some(source) = source_unit {
                source.convert(0.0, si)?;
            }
        }

        let convert_to_us = config.convert_to_us && unit_system == UnitSystem::Us;
        let target_unit = if config.convert_to_us {
            let us = config.us_unit.as_deref().ok_or_else(|| SyncError::InvalidConfig {
                field: format!("{}.us_unit", config.device_name),
                reason: "convert_to_us is set but no us_unit is configured".to_string(),
            })?;
            let us: Unit = us.parse()?;
            if let Some(source) = source_unit {
                source.convert(0.0, us)?;
            }
            convert_to_us.then_some(us)
        } else {
            None
        };

        Ok(Self {
            simulator_name: config.simulator_name.clone(),
            override_point: config.override_point.clone(),
            device_name: config.device_name.clone(),
            object_type,
            priority: config.priority,
            threshold: config.threshold,
            activate: config.activate,
            source_unit,
            target_unit,
            resolution: Resolution::Unresolved,
            current_value: None,
            pending_write: None,
            pending_generation: 0,
            out_of_service_session: None,
            feedback_value: None,
            last_failure: None,
        })
    }

    pub fn simulator_name(&self) -> &str {
        &self.simulator_name
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn is_activation(&self) -> bool {
        self.activate
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn instance(&self) -> Option<u32> {
        match self.resolution {
            Resolution::Resolved(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn current_value(&self) -> Option<PointValue> {
        self.current_value
    }

    pub fn pending_write(&self) -> Option<PointValue> {
        self.pending_write
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Convert a simulator sample and store it as the pending device write
    ///
    /// Never fails: bad samples come back as [`ProcessOutcome::Dropped`] and
    /// leave the point untouched.
    pub fn process_bop_value(
        &mut self,
        raw: f64,
        metadata: Option<&SignalMetadata>,
    ) -> ProcessOutcome {
        if self.activate {
            let active = if self.object_type.is_binary() {
                PointValue::Binary(true)
            } else {
                PointValue::Analog(1.0)
            };
            // Activation points are re-sent every step
            self.set_pending(active);
            return ProcessOutcome::Pending(active);
        }

        if !raw.is_finite() {
            return ProcessOutcome::Dropped(DropReason::NotFinite(raw));
        }

        let converted = match self.target_unit {
            Some(target) => {
                let source = match self.source_unit.or_else(|| metadata_unit(metadata)) {
                    Some(source) => source,
                    None => return ProcessOutcome::Dropped(DropReason::MissingMetadata),
                };
                match source.convert(raw, target) {
                    Ok(v) => v,
                    Err(e) => return ProcessOutcome::Dropped(DropReason::Conversion(e.to_string())),
                }
            },
            None => raw,
        };

        let encoded = match self.object_type {
            ObjectType::BinaryInput | ObjectType::BinaryValue => {
                PointValue::Binary(self.threshold.map_or(converted != 0.0, |t| converted >= t))
            },
            ObjectType::BinaryOutput => match self.threshold {
                Some(t) => PointValue::Binary(converted >= t),
                None if converted == 0.0 => PointValue::Binary(false),
                None if converted == 1.0 => PointValue::Binary(true),
                None => return ProcessOutcome::Dropped(DropReason::NotBinary(converted)),
            },
            ObjectType::AnalogOutput => {
                let (min, max) = metadata
                    .map(|m| (m.min, m.max))
                    .unwrap_or((None, None));
                let mut v = converted;
                if let Some(max) = max.filter(|m| m.is_finite()) {
                    v = v.min(max);
                }
                if let Some(min) = min.filter(|m| m.is_finite()) {
                    v = v.max(min);
                }
                PointValue::Analog(v)
            },
            ObjectType::AnalogInput | ObjectType::AnalogValue => PointValue::Analog(converted),
        };

        let already_there = match self.pending_write {
            Some(pending) => pending == encoded,
            None => self.current_value == Some(encoded),
        };
        if already_there {
            debug!("{} unchanged at {}", self.device_name, encoded);
            return ProcessOutcome::Unchanged(encoded);
        }

        self.set_pending(encoded);
        ProcessOutcome::Pending(encoded)
    }

    fn set_pending(&mut self, value: PointValue) {
        self.pending_write = Some(value);
        self.pending_generation += 1;
    }

    /// Bind the point to its device instance number
    ///
    /// A resolved identity is immutable; only [`Point::invalidate_identity`]
    /// or [`Point::reset_resolution`] reopen it.
    pub fn resolve_identity(&mut self, index: &EndpointIndex) -> SyncResult<u32> {
        if let Resolution::Resolved(instance) = self.resolution {
            return Ok(instance);
        }
        match index.lookup(self.object_type, &self.device_name) {
            Some(instance) => {
                self.resolution = Resolution::Resolved(instance);
                // A new binding starts without an out-of-service assertion
                self.out_of_service_session = None;
                Ok(instance)
            },
            None => {
                self.resolution = Resolution::Missing;
                Err(SyncError::PointResolution {
                    object_type: self.object_type.to_string(),
                    name: self.device_name.clone(),
                })
            },
        }
    }

    /// Device answered "not found" for this object: look it up again later
    pub fn invalidate_identity(&mut self) {
        warn!(
            "{} {} no longer found on device; will re-resolve",
            self.object_type, self.device_name
        );
        self.resolution = Resolution::Stale;
        self.out_of_service_session = None;
    }

    /// Make a `Missing` point eligible for resolution again
    pub fn reset_resolution(&mut self) {
        if !matches!(self.resolution, Resolution::Resolved(_)) {
            self.resolution = Resolution::Unresolved;
        }
    }

    pub fn needs_resolution(&self) -> bool {
        matches!(self.resolution, Resolution::Unresolved | Resolution::Stale)
    }

    fn object_ref(&self) -> Option<ObjectRef> {
        self.instance().map(|instance| ObjectRef {
            object_type: self.object_type,
            instance,
        })
    }

    /// Whether the device value is read back each device cycle
    pub fn is_read_target(&self) -> bool {
        !self.activate && (self.object_type.is_output() || self.override_point.is_some())
    }

    /// Snapshot of the pending write, with the generation it belongs to
    pub fn write_op(&self) -> Option<(WriteOp, u64)> {
        let value = self.pending_write?;
        let object = self.object_ref()?;
        Some((
            WriteOp {
                key: self.device_name.clone(),
                object,
                value,
                priority: self.priority,
            },
            self.pending_generation,
        ))
    }

    pub fn read_op(&self) -> Option<ReadOp> {
        if !self.is_read_target() {
            return None;
        }
        self.object_ref().map(|object| ReadOp {
            key: self.device_name.clone(),
            object,
        })
    }

    /// Whether an out-of-service assertion is still owed for `session`
    pub fn needs_out_of_service(&self, session: u64) -> bool {
        self.object_type.requires_out_of_service()
            && self.instance().is_some()
            && self.out_of_service_session != Some(session)
    }

    pub fn mark_out_of_service(&mut self, session: u64) {
        self.out_of_service_session = Some(session);
    }

    /// Record a successful write of `value`
    ///
    /// The pending slot is cleared only if nothing newer arrived while the
    /// batch was in flight.
    pub fn apply_write_success(&mut self, value: PointValue, generation: u64) {
        self.current_value = Some(value);
        self.last_failure = None;
        if self.pending_generation == generation {
            self.pending_write = None;
        }
    }

    /// Record a failed write; the pending value stays queued
    pub fn apply_write_failure(&mut self, reason: impl Into<String>) {
        self.last_failure = Some(reason.into());
    }

    /// Store a value read back from the device
    pub fn apply_read(&mut self, raw: &Value) -> Option<PointValue> {
        match decode_device_value(self.object_type, raw) {
            Some(value) => {
                self.current_value = Some(value);
                self.feedback_value = Some(value);
                Some(value)
            },
            None => {
                warn!(
                    "{} {}: undecodable present-value {}",
                    self.object_type, self.device_name, raw
                );
                None
            },
        }
    }

    /// Control inputs to send to the simulator for the last device read
    ///
    /// Analog outputs report percent of span and are normalised to a 0..1
    /// fraction; binary values become 1/0. The override flag, when
    /// configured, is always 1.
    pub fn feedback(&self) -> Vec<(String, f64)> {
        let value = match self.feedback_value {
            Some(value) => value,
            None => return Vec::new(),
        };
        let signal = match (self.object_type, value) {
            (ObjectType::AnalogOutput, PointValue::Analog(percent)) => {
                (percent / 100.0).clamp(0.0, 1.0)
            },
            (_, PointValue::Binary(b)) => f64::from(u8::from(b)),
            (_, PointValue::Analog(v)) => match (self.target_unit, self.source_unit) {
                // Undo the display conversion
                (Some(target), Some(source)) => target.convert(v, source).unwrap_or(v),
                _ => v,
            },
        };
        let mut inputs = vec![(self.simulator_name.clone(), signal)];
        if let Some(override_point) = &self.override_point {
            inputs.push((override_point.clone(), 1.0));
        }
        inputs
    }

    /// Forget the last read so it is not replayed into the next advance
    pub fn clear_feedback(&mut self) {
        self.feedback_value = None;
    }
}

fn metadata_unit(metadata: Option<&SignalMetadata>) -> Option<Unit> {
    metadata
        .and_then(|m| m.unit.as_deref())
        .and_then(|u| u.parse::<Unit>().ok())
}
