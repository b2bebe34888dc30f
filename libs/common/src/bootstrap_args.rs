//! Common command-line arguments for the sync services
//!
//! Provides a unified argument structure that individual services can flatten
//! into their own parsers.

use std::path::PathBuf;

#[cfg(feature = "cli")]
use clap::Parser;

/// Common service startup arguments
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cli", derive(Parser))]
#[cfg_attr(feature = "cli", clap(author, version, about))]
pub struct ServiceArgs {
    /// Path to the service settings file (YAML)
    #[cfg_attr(
        feature = "cli",
        clap(short = 'c', long, default_value = "config/syncsrv.yaml", env = "SYNCSRV_CONFIG")
    )]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[cfg_attr(feature = "cli", clap(short = 'l', long))]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[cfg_attr(feature = "cli", clap(long))]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[cfg_attr(feature = "cli", clap(long))]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config/syncsrv.yaml"),
            log_level: None,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Resolve the effective log level: command line first, then settings
    pub fn effective_log_level(&self, configured: &str) -> String {
        match self.log_level.as_deref().map(str::to_lowercase).as_deref() {
            Some("trace") => "trace".to_string(),
            Some("debug") => "debug".to_string(),
            Some("info") => "info".to_string(),
            Some("warn") | Some("warning") => "warn".to_string(),
            Some("error") => "error".to_string(),
            _ => configured.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = ServiceArgs::default();
        assert_eq!(args.config, PathBuf::from("config/syncsrv.yaml"));
        assert!(args.log_level.is_none());
        assert!(!args.validate);
    }

    #[test]
    fn test_effective_log_level() {
        let args = ServiceArgs {
            log_level: Some("WARNING".to_string()),
            ..Default::default()
        };
        assert_eq!(args.effective_log_level("info"), "warn");

        let args = ServiceArgs {
            log_level: Some("verbose".to_string()),
            ..Default::default()
        };
        assert_eq!(args.effective_log_level("debug"), "debug");

        assert_eq!(ServiceArgs::default().effective_log_level("error"), "error");
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_parse_cli() {
        let args = ServiceArgs::parse_from(["syncsrv", "--validate", "-l", "debug", "-c", "x.yaml"]);
        assert!(args.validate);
        assert_eq!(args.config, PathBuf::from("x.yaml"));
        assert_eq!(args.effective_log_level("info"), "debug");
    }
}
