//! Monitor configuration

use obd_protocol::{BluetoothConfig, CommandCode, SerialConfig, TransportKind};
use obd_scheduler::{PollingConfig, DEFAULT_POLL_INTERVAL_MS};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

/// File looked up (with any supported extension) when no path is given
pub const DEFAULT_CONFIG_NAME: &str = "obd-monitor";

/// Prefix of environment overrides, e.g. `OBD__SERIAL__PORT`
const ENV_PREFIX: &str = "OBD";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but are unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Which link to use
    pub transport: TransportKind,
    /// PIDs to poll; a comma-separated string is accepted as well
    #[serde(deserialize_with = "pid_list")]
    pub pids: Vec<CommandCode>,
    /// Time between two polls of the same PID (ms)
    pub poll_interval_ms: u64,
    /// Maximum log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Bluetooth link settings
    pub bluetooth: BluetoothConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            pids: CommandCode::default_monitor_set(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            log_level: "info".to_string(),
            serial: SerialConfig::default(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

/// `pids` as a list, or as one comma-separated string (environment overrides).
///
/// Values stay strings so numeric-looking PIDs such as `0105` keep their digits.
fn pid_list<'de, D>(deserializer: D) -> Result<Vec<CommandCode>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PidList {
        List(Vec<CommandCode>),
        Joined(String),
    }

    Ok(match PidList::deserialize(deserializer)? {
        PidList::List(pids) => pids,
        PidList::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|pid| !pid.is_empty())
            .map(CommandCode::from)
            .collect(),
    })
}

/// `OBD__*` environment overrides
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
}

impl MonitorConfig {
    /// Load from `path` (or the optional default file) plus `OBD__*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_NAME))
            .required(path.is_some());
        Self::from_builder(config::Config::builder().add_source(file), environment())
    }

    /// Parse a TOML document plus environment overrides
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Self::from_builder(toml_source(document), environment())
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let settings = builder.add_source(environment).build()?;

        let config: MonitorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pids.is_empty() {
            return Err(ConfigError::Invalid("at least one PID is required".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        match self.transport {
            TransportKind::Serial => {
                if self.serial.port.is_empty() {
                    return Err(ConfigError::Invalid("serial.port cannot be empty".to_string()));
                }
                if self.serial.baud_rate == 0 {
                    return Err(ConfigError::Invalid(
                        "serial.baud_rate must be greater than zero".to_string(),
                    ));
                }
            }
            TransportKind::Bluetooth => {
                if self.bluetooth.address.is_empty() {
                    return Err(ConfigError::Invalid(
                        "bluetooth.address is required for the bluetooth transport".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Polling engine settings
    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn toml_source(document: &str) -> config::ConfigBuilder<config::builder::DefaultState> {
    config::Config::builder().add_source(config::File::from_str(
        document,
        config::FileFormat::Toml,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env(document: &str, vars: &[(&str, &str)]) -> Result<MonitorConfig, ConfigError> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MonitorConfig::from_builder(toml_source(document), environment().source(Some(vars)))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport, TransportKind::Serial);
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.polling().interval, Duration::from_secs(2));
        assert_eq!(config.pids.len(), 4);
    }

    #[test]
    fn test_parses_bluetooth_document() {
        let config = MonitorConfig::from_toml(
            r#"
            transport = "bluetooth"
            pids = ["010C", "012F"]
            poll_interval_ms = 500

            [bluetooth]
            address = "00:1D:A5:68:98:8B"
            discovery_window_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportKind::Bluetooth);
        assert_eq!(config.pids, vec![CommandCode::ENGINE_RPM, CommandCode::FUEL_LEVEL]);
        assert_eq!(config.bluetooth.address, "00:1D:A5:68:98:8B");
        assert_eq!(config.bluetooth.discovery_window_ms, 5000);
        // Untouched fields keep their defaults
        assert_eq!(config.bluetooth.exchange_timeout_ms, 2000);
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_bluetooth_requires_address() {
        let err = MonitorConfig::from_toml(r#"transport = "bluetooth""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_empty_pid_list_and_zero_interval() {
        assert!(matches!(
            MonitorConfig::from_toml("pids = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MonitorConfig::from_toml("poll_interval_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = with_env(
            r#"
            [serial]
            port = "COM3"
            baud_rate = 115200
            "#,
            &[("OBD__SERIAL__BAUD_RATE", "38400"), ("OBD__POLL_INTERVAL_MS", "500")],
        )
        .unwrap();

        assert_eq!(config.serial.port, "COM3");
        assert_eq!(config.serial.baud_rate, 38400);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_numeric_looking_pids_from_environment() {
        let single = with_env("", &[("OBD__PIDS", "0105")]).unwrap();
        assert_eq!(single.pids, vec![CommandCode::COOLANT_TEMPERATURE]);

        let several = with_env("", &[("OBD__PIDS", "0104, 0110,010C")]).unwrap();
        assert_eq!(
            several.pids,
            vec![CommandCode::ENGINE_LOAD, CommandCode::MAF, CommandCode::ENGINE_RPM]
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = MonitorConfig::load(Some("/nonexistent/obd-monitor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
