//! Equipment configuration files
//!
//! One JSON document per equipment unit:
//!
//! ```json
//! {
//!   "equipment_name": "AHU-1",
//!   "device_ip": "10.0.0.5",
//!   "points": [
//!     {"bop_point": "hvac_reaAhu_TSup_y", "ecy_point": "DischAirTemp",
//!      "object_type": "AnalogInput", "unit": "K", "si_unit": "degC",
//!      "us_unit": "degF", "convert_to_us": true}
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use errors::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::point::ObjectType;
use crate::units::{check_convertible, Unit};

/// Mapping of one simulator signal onto one device object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    #[serde(rename = "bop_point")]
    pub simulator_name: String,
    #[serde(rename = "ecy_point")]
    pub device_name: String,
    pub object_type: ObjectType,
    /// Native unit of the simulator signal; falls back to simulator metadata
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub si_unit: Option<String>,
    #[serde(default)]
    pub us_unit: Option<String>,
    #[serde(default)]
    pub convert_to_us: bool,
    /// Priority-array slot for commandable writes; absent means a plain
    /// present-value write
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Simulator override flag sent alongside device feedback
    #[serde(rename = "bop_override_point", default)]
    pub override_point: Option<String>,
    /// Always write the active value, ignoring the simulator sample
    #[serde(default)]
    pub activate: bool,
}

impl PointConfig {
    fn validate(&self) -> SyncResult<()> {
        let field = |name: &str| format!("{}.{}", self.device_name, name);

        if self.simulator_name.trim().is_empty() {
            return Err(SyncError::InvalidConfig {
                field: field("bop_point"),
                reason: "must not be empty".to_string(),
            });
        }

        if matches!(self.object_type, ObjectType::BinaryInput | ObjectType::BinaryValue)
            && !self.activate
            && !self.threshold.is_some_and(f64::is_finite)
        {
            return Err(SyncError::InvalidConfig {
                field: field("threshold"),
                reason: format!("a finite threshold is required for {}", self.object_type),
            });
        }

        let unit = self.unit.as_deref().map(str::parse::<Unit>).transpose()?;
        let si_unit = self.si_unit.as_deref().map(str::parse::<Unit>).transpose()?;
        let us_unit = self.us_unit.as_deref().map(str::parse::<Unit>).transpose()?;

        if self.convert_to_us && us_unit.is_none() {
            return Err(SyncError::InvalidConfig {
                field: field("us_unit"),
                reason: "convert_to_us is set but no us_unit is configured".to_string(),
            });
        }
        if let Some(unit) = unit {
            for target in [si_unit, us_unit].into_iter().flatten() {
                check_convertible(unit.as_str(), target.as_str())?;
            }
        }
        Ok(())
    }
}

/// One equipment unit: a device and the points mapped onto it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentConfig {
    #[serde(default = "default_equipment_name")]
    pub equipment_name: String,
    pub device_ip: String,
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

fn default_equipment_name() -> String {
    "UnnamedEquipment".to_string()
}

impl EquipmentConfig {
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let config: EquipmentConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.device_ip.trim().is_empty() {
            return Err(SyncError::InvalidConfig {
                field: format!("{}.device_ip", self.equipment_name),
                reason: "must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for point in &self.points {
            if !seen.insert(point.device_name.as_str()) {
                return Err(SyncError::InvalidConfig {
                    field: format!("{}.points", self.equipment_name),
                    reason: format!("duplicate ecy_point '{}'", point.device_name),
                });
            }
            point.validate()?;
        }
        Ok(())
    }
}

/// Load every `*.json` file in `dir`, sorted by name
///
/// Each file is loaded independently; a broken file yields an error entry
/// naming it and does not affect the others. Only an unreadable directory is
/// an error for the whole call.
pub fn load_equipment_dir(
    dir: impl AsRef<Path>,
) -> SyncResult<Vec<(PathBuf, SyncResult<EquipmentConfig>)>> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| SyncError::Config(format!("Cannot read equipment dir {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let results: Vec<_> = files
        .into_iter()
        .map(|path| {
            let result = load_equipment_file(&path);
            (path, result)
        })
        .collect();

    info!(
        "Found {} equipment files in {} ({} valid)",
        results.len(),
        dir.display(),
        results.iter().filter(|(_, r)| r.is_ok()).count()
    );
    Ok(results)
}

pub fn load_equipment_file(path: &Path) -> SyncResult<EquipmentConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
    let config = EquipmentConfig::from_json(&text)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
    debug!(
        "Loaded {} ({} points) from {}",
        config.equipment_name,
        config.points.len(),
        path.display()
    );
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    fn equipment(points: serde_json::Value) -> String {
        json!({"equipment_name": "AHU-1", "device_ip": "10.0.0.5", "points": points}).to_string()
    }

    #[test]
    fn test_parse_field_aliases() {
        let text = equipment(json!([{
            "bop_point": "hvac_reaAhu_TSup_y",
            "ecy_point": "DischAirTemp",
            "object_type": "AnalogInput",
            "unit": "K",
            "si_unit": "degC",
            "us_unit": "degF",
            "convert_to_us": true
        }, {
            "bop_point": "oveDamper_u",
            "ecy_point": "DamperCmd",
            "object_type": "analog-output",
            "priority": 8,
            "bop_override_point": "oveDamper_activate"
        }]));

        let config = EquipmentConfig::from_json(&text).unwrap();
        assert_eq!(config.points.len(), 2);
        let temp = &config.points[0];
        assert_eq!(temp.simulator_name, "hvac_reaAhu_TSup_y");
        assert_eq!(temp.device_name, "DischAirTemp");
        assert!(temp.convert_to_us);
        assert_eq!(temp.priority, None);

        let damper = &config.points[1];
        assert_eq!(damper.object_type, ObjectType::AnalogOutput);
        assert_eq!(damper.priority, Some(8));
        assert_eq!(damper.override_point.as_deref(), Some("oveDamper_activate"));
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = equipment(json!([
            {"bop_point": "a", "ecy_point": "X", "object_type": "AnalogValue"},
            {"bop_point": "b", "ecy_point": "X", "object_type": "AnalogValue"}
        ]));
        assert!(EquipmentConfig::from_json(&duplicate).is_err());

        let no_threshold = equipment(json!([
            {"bop_point": "a", "ecy_point": "Fan", "object_type": "BinaryInput"}
        ]));
        assert!(EquipmentConfig::from_json(&no_threshold).is_err());

        let no_us_unit = equipment(json!([
            {"bop_point": "a", "ecy_point": "T", "object_type": "AnalogInput", "unit": "K", "convert_to_us": true}
        ]));
        assert!(EquipmentConfig::from_json(&no_us_unit).is_err());

        let bad_unit = equipment(json!([
            {"bop_point": "a", "ecy_point": "T", "object_type": "AnalogInput", "unit": "parsec"}
        ]));
        assert!(matches!(
            EquipmentConfig::from_json(&bad_unit),
            Err(SyncError::UnsupportedUnit(_))
        ));

        let cross_family = equipment(json!([
            {"bop_point": "a", "ecy_point": "T", "object_type": "AnalogInput", "unit": "K", "si_unit": "Pa"}
        ]));
        assert!(matches!(
            EquipmentConfig::from_json(&cross_family),
            Err(SyncError::IncompatibleUnits { .. })
        ));

        let no_ip = json!({"equipment_name": "X", "device_ip": " ", "points": []}).to_string();
        assert!(EquipmentConfig::from_json(&no_ip).is_err());
    }

    #[test]
    fn test_load_dir_isolates_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b_ahu.json"),
            equipment(json!([{"bop_point": "a", "ecy_point": "X", "object_type": "AnalogValue"}])),
        )
        .unwrap();
        fs::write(dir.path().join("a_broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let results = load_equipment_dir(dir.path()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].0.ends_with("a_broken.json"));
        assert!(matches!(results[0].1, Err(SyncError::Config(_))));
        assert_eq!(results[1].1.as_ref().unwrap().equipment_name, "AHU-1");
    }
}
