//! Process settings
//!
//! Loaded once at startup: built-in defaults, then the YAML file, then
//! `SYNCSRV_` environment variables (`__` separates nesting levels, e.g.
//! `SYNCSRV_DEVICE__PASSWORD`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use errors::{SyncError, SyncResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::units::UnitSystem;

/// Format of `simulator.start_time`
pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Settings sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub url: String,
    /// Test case to select before initialisation
    pub testcase: Option<String>,
    /// Wall-clock start, `YYYY-MM-DD HH:MM:SS` in the configured timezone
    pub start_time: Option<String>,
    pub warmup_period_secs: f64,
    pub step_secs: f64,
    pub request_timeout_ms: u64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000".to_string(),
            testcase: None,
            start_time: None,
            warmup_period_secs: 0.0,
            step_secs: 60.0,
            request_timeout_ms: 30_000,
        }
    }
}

/// Retry policy in configuration form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub username: String,
    pub password: String,
    pub scheme: String,
    /// Controllers ship self-signed certificates
    pub accept_invalid_certs: bool,
    pub request_timeout_ms: u64,
    pub sync_interval_ms: u64,
    pub retry: RetrySettings,
    pub auth_retry: RetrySettings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            scheme: "https".to_string(),
            accept_invalid_certs: true,
            request_timeout_ms: 10_000,
            sync_interval_ms: 5_000,
            retry: RetrySettings::default(),
            auth_retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for the rolling log file; console only when absent
    pub dir: Option<PathBuf>,
    pub file: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: "syncsrv.log".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub simulator: SimulatorSettings,
    pub device: DeviceSettings,
    pub unit_system: UnitSystem,
    /// IANA timezone; enables device time sync when set
    pub timezone: Option<String>,
    pub equipment_dir: PathBuf,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            simulator: SimulatorSettings::default(),
            device: DeviceSettings::default(),
            unit_system: UnitSystem::default(),
            timezone: None,
            equipment_dir: PathBuf::from("configs"),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(SyncError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("SYNCSRV_").split("__"))
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.username.trim().is_empty() || self.device.password.is_empty() {
            return Err(SyncError::Config(
                "device.username and device.password are required".to_string(),
            ));
        }
        if !(self.simulator.step_secs.is_finite() && self.simulator.step_secs > 0.0) {
            return Err(SyncError::Config(format!(
                "simulator.step_secs must be positive, got {}",
                self.simulator.step_secs
            )));
        }
        if self.simulator.warmup_period_secs < 0.0 {
            return Err(SyncError::Config(format!(
                "simulator.warmup_period_secs must not be negative, got {}",
                self.simulator.warmup_period_secs
            )));
        }
        if self.device.sync_interval_ms == 0 {
            return Err(SyncError::Config(
                "device.sync_interval_ms must be positive".to_string(),
            ));
        }
        self.tz()?;
        self.start_epoch()?;
        Ok(())
    }

    /// Configured timezone, UTC when absent
    pub fn tz(&self) -> SyncResult<Tz> {
        match self.timezone.as_deref() {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| SyncError::Config(format!("unknown timezone '{}': {}", name, e))),
            None => Ok(Tz::UTC),
        }
    }

    /// Simulation start as Unix seconds, if a start time is configured
    pub fn start_epoch(&self) -> SyncResult<Option<i64>> {
        let Some(raw) = self.simulator.start_time.as_deref() else {
            return Ok(None);
        };
        let naive = NaiveDateTime::parse_from_str(raw.trim(), START_TIME_FORMAT).map_err(|e| {
            SyncError::Config(format!(
                "simulator.start_time '{}' is not {}: {}",
                raw, START_TIME_FORMAT, e
            ))
        })?;
        let local = self
            .tz()?
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| {
                SyncError::Config(format!("simulator.start_time '{}' does not exist locally", raw))
            })?;
        Ok(Some(local.timestamp()))
    }

    /// Epoch pushed to device clocks: the simulation start, or now
    pub fn clock_epoch(&self) -> SyncResult<i64> {
        Ok(self.start_epoch()?.unwrap_or_else(|| Utc::now().timestamp()))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.device.sync_interval_ms)
    }

    pub fn step_period(&self) -> Duration {
        Duration::from_secs_f64(self.simulator.step_secs)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.device.username = "admin".to_string();
        settings.device.password = "secret".to_string();
        settings
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load("/nonexistent/syncsrv.yaml").unwrap();
        assert_eq!(settings.simulator.url, "http://127.0.0.1:5000");
        assert_eq!(settings.simulator.step_secs, 60.0);
        assert_eq!(settings.device.retry.max_attempts, 3);
        assert_eq!(settings.unit_system, UnitSystem::Si);
        assert_eq!(settings.equipment_dir, PathBuf::from("configs"));
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "unit_system: US\ntimezone: America/Chicago\ndevice:\n  username: ops\n  password: pw\n  retry:\n    max_attempts: 5\nsimulator:\n  step_secs: 300\n  start_time: \"2024-01-15 06:00:00\""
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.unit_system, UnitSystem::Us);
        assert_eq!(settings.device.username, "ops");
        assert_eq!(settings.device.retry.max_attempts, 5);
        assert_eq!(settings.device.retry.initial_delay_ms, 500);
        assert_eq!(settings.simulator.step_secs, 300.0);
        settings.validate().unwrap();
        // 06:00 CST == 12:00 UTC
        assert_eq!(settings.start_epoch().unwrap(), Some(1_705_320_000));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(Settings::default().validate().is_err());
        valid().validate().unwrap();

        let mut settings = valid();
        settings.simulator.step_secs = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.device.sync_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.timezone = Some("Nowhere/Special".to_string());
        assert!(matches!(settings.validate(), Err(SyncError::Config(_))));

        let mut settings = valid();
        settings.simulator.start_time = Some("15/01/2024".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_start_time_defaults_to_utc() {
        let mut settings = valid();
        settings.simulator.start_time = Some("2024-01-15 12:00:00".to_string());
        assert_eq!(settings.start_epoch().unwrap(), Some(1_705_320_000));
        assert_eq!(settings.clock_epoch().unwrap(), 1_705_320_000);
    }
}
