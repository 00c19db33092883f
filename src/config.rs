/*!
 * Server configuration
 */

use std::path::{Path, PathBuf};

use beamline_proto::ProtocolVersion;
use serde::{Deserialize, Serialize};

use crate::error::{BeamlineError, Result};

/// Everything the receiver, the workers and the scheduler need to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Root of the physical file store
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// SQLite database location (`sqlite://` prefix optional)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Address the receiver binds to
    #[serde(default = "default_receiver_bind")]
    pub receiver_bind: String,

    /// Host name agents dial back to, optionally with a port
    #[serde(default = "default_receiver_host")]
    pub receiver_host: String,

    /// Directory holding `<version>/<os>/beamline-agent[.exe]`
    #[serde(default = "default_agent_assets_dir")]
    pub agent_assets_dir: PathBuf,

    /// Protocol generation used when a request does not name one
    #[serde(default = "default_protocol_version", with = "version_serde")]
    pub default_protocol_version: ProtocolVersion,

    /// Days a completed beam is kept when its type sets no threshold
    #[serde(default = "default_vacuum_threshold_days")]
    pub vacuum_threshold_days: u32,

    /// Seconds an agent has to make first contact before the beam is failed
    #[serde(default = "default_contact_timeout")]
    pub combadge_contact_timeout_secs: u64,

    /// External `sha512sum`-compatible tool; hashed in-process when unset
    #[serde(default)]
    pub checksum_tool: Option<PathBuf>,

    /// Files re-hashed per checksum validation run
    #[serde(default = "default_checksum_batch")]
    pub checksum_batch: u32,

    /// Concurrent jobs on the task queue
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Disk usage percentage above which the free-space check complains
    #[serde(default)]
    pub free_space_threshold_percent: Option<f64>,

    /// Seconds between nightly runs (tracker refresh, vacuum, checksum validation)
    #[serde(default = "default_vacuum_interval")]
    pub vacuum_interval_secs: u64,

    /// Seconds between watchdog sweeps
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Seconds between free-space checks
    #[serde(default = "default_free_space_interval")]
    pub free_space_interval_secs: u64,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            database_url: default_database_url(),
            receiver_bind: default_receiver_bind(),
            receiver_host: default_receiver_host(),
            agent_assets_dir: default_agent_assets_dir(),
            default_protocol_version: default_protocol_version(),
            vacuum_threshold_days: default_vacuum_threshold_days(),
            combadge_contact_timeout_secs: default_contact_timeout(),
            checksum_tool: None,
            checksum_batch: default_checksum_batch(),
            worker_concurrency: default_worker_concurrency(),
            free_space_threshold_percent: None,
            vacuum_interval_secs: default_vacuum_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            free_space_interval_secs: default_free_space_interval(),
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

mod version_serde {
    use beamline_proto::ProtocolVersion;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &ProtocolVersion, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ProtocolVersion, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/beamline/storage")
}

fn default_database_url() -> String {
    "sqlite:///var/lib/beamline/beamline.db".to_string()
}

fn default_receiver_bind() -> String {
    format!("0.0.0.0:{}", beamline_proto::RECEIVER_PORT)
}

fn default_receiver_host() -> String {
    "scotty".to_string()
}

fn default_agent_assets_dir() -> PathBuf {
    PathBuf::from("/var/lib/beamline/assets")
}

fn default_protocol_version() -> ProtocolVersion {
    ProtocolVersion::V2
}

fn default_vacuum_threshold_days() -> u32 {
    60
}

fn default_contact_timeout() -> u64 {
    60 * 60
}

fn default_checksum_batch() -> u32 {
    100
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_vacuum_interval() -> u64 {
    24 * 60 * 60
}

fn default_watchdog_interval() -> u64 {
    15 * 60
}

fn default_free_space_interval() -> u64 {
    60 * 60
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BeamlineError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = toml::from_str(&contents)
            .map_err(|e| BeamlineError::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the scheduler or purge everything at once.
    pub fn validate(&self) -> Result<()> {
        if self.vacuum_threshold_days == 0 {
            return Err(BeamlineError::Config(
                "vacuum_threshold_days must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(BeamlineError::Config(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("combadge_contact_timeout_secs", self.combadge_contact_timeout_secs),
            ("vacuum_interval_secs", self.vacuum_interval_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("free_space_interval_secs", self.free_space_interval_secs),
        ] {
            if value == 0 {
                return Err(BeamlineError::Config(format!("{} must be positive", name)));
            }
        }
        if let Some(percent) = self.free_space_threshold_percent {
            if !(0.0..=100.0).contains(&percent) {
                return Err(BeamlineError::Config(format!(
                    "free_space_threshold_percent must be within 0..=100, got {}",
                    percent
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.vacuum_threshold_days, 60);
        assert_eq!(config.receiver_bind, "0.0.0.0:9000");
        assert_eq!(config.default_protocol_version, ProtocolVersion::V2);
        assert!(config.checksum_tool.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
storage_path = "/srv/beams"
vacuum_threshold_days = 30
default_protocol_version = "v1"
checksum_tool = "/usr/bin/sha512sum"
log_level = "debug"
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/srv/beams"));
        assert_eq!(config.vacuum_threshold_days, 30);
        assert_eq!(config.default_protocol_version, ProtocolVersion::V1);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.combadge_contact_timeout_secs, 3600);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = ServerConfig {
            vacuum_threshold_days: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BeamlineError::Config(_))));
    }

    #[test]
    fn test_bad_percentage_rejected() {
        let config = ServerConfig {
            free_space_threshold_percent: Some(140.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = ServerConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
