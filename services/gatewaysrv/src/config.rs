//! Service configuration
//!
//! Loaded with figment from a YAML file overlaid by `GATEWAYSRV_*` environment
//! variables (see `common::config_loader`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::LogFormat;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorExt, GatewayError, Result};
use crate::template::is_path_safe;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "GATEWAYSRV";

/// Default fast poll interval when neither the device nor the template sets one
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default interval between repeated identical error log lines
pub const DEFAULT_ERROR_LOG_INTERVAL_MS: u64 = 60_000;

fn default_service_name() -> String {
    "gatewaysrv".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_error_log_interval_ms() -> u64 {
    DEFAULT_ERROR_LOG_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

/// Whole service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            templates_dir: default_templates_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Minimum spacing of identical error log lines per device
    #[serde(default = "default_error_log_interval_ms")]
    pub error_log_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            error_log_interval_ms: DEFAULT_ERROR_LOG_INTERVAL_MS,
        }
    }
}

/// One configured device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub protocol: String,
    pub template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Replaces the template's fast poll interval
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Protocol specific connection parameters
    #[serde(default)]
    pub connection: serde_json::Map<String, serde_json::Value>,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            protocol: protocol.into(),
            template: template.into(),
            enabled: true,
            poll_interval_ms: None,
            connection: serde_json::Map::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Decode the connection block into a protocol's parameter type
    pub fn connection_params<T>(&self) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(serde_json::Value::Object(self.connection.clone()))
            .config_error(&format!("Device '{}' connection", self.id))
    }

    pub fn validate(&self) -> Result<()> {
        if !is_path_safe(&self.id) {
            return Err(GatewayError::config(format!(
                "Device id '{}' may only contain letters, digits, '_' and '-'",
                self.id
            )));
        }
        if self.protocol.trim().is_empty() {
            return Err(GatewayError::config(format!(
                "Device '{}' has no protocol",
                self.id
            )));
        }
        if self.template.trim().is_empty() {
            return Err(GatewayError::config(format!(
                "Device '{}' has no template",
                self.id
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(GatewayError::config(format!(
                "Device '{}': poll_interval_ms must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = common::load_config_from_file(path, Some(ENV_PREFIX))
            .map_err(|e| GatewayError::config(e.to_string()))?;
        Ok(config)
    }

    /// Checks that do not depend on templates; per-device problems are
    /// reported by [`DeviceConfig::validate`] when the device starts
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }
        }
        if self.runtime.error_log_interval_ms == 0 {
            return Err(GatewayError::config(
                "runtime.error_log_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::modbus::types::ModbusTcpParams;

    const CONFIG: &str = r#"
service:
  templates_dir: /etc/gatewaysrv/templates
logging:
  level: debug
devices:
  - id: inverter-1
    protocol: modbus_tcp
    template: sunspec_inverter
    poll_interval_ms: 2000
    connection:
      host: 192.168.1.20
      unit_id: 3
  - id: sim
    protocol: virtual
    template: demo_meter
    enabled: false
"#;

    #[test]
    fn test_load_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatewaysrv.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = AppConfig::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.service.name, "gatewaysrv");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.runtime.error_log_interval_ms, 60_000);
        assert_eq!(config.devices.len(), 2);
        assert!(config.devices[0].enabled);
        assert!(!config.devices[1].enabled);

        let params: ModbusTcpParams = config.devices[0].connection_params().unwrap();
        assert_eq!(params.host, "192.168.1.20");
        assert_eq!(params.port, 502);
        assert_eq!(params.unit_id, 3);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("/nonexistent/gatewaysrv.yaml"),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let mut config = AppConfig::default();
        config.devices.push(DeviceConfig::new("a", "virtual", "t"));
        config.devices.push(DeviceConfig::new("a", "virtual", "t"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_id_must_be_path_safe() {
        assert!(DeviceConfig::new("meter.1", "virtual", "t").validate().is_err());
        assert!(DeviceConfig::new("meter_1", "virtual", "t").validate().is_ok());
    }

    #[test]
    fn test_unknown_connection_field() {
        let mut device = DeviceConfig::new("a", "modbus_tcp", "t");
        device
            .connection
            .insert("host".into(), serde_json::json!("10.0.0.1"));
        device
            .connection
            .insert("hots".into(), serde_json::json!("typo"));
        assert!(device.connection_params::<ModbusTcpParams>().is_err());
    }
}
