//! Configuration loading helpers
//!
//! Layers a config file (format picked from its extension) under
//! prefixed environment variables, then extracts a typed structure.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use tracing::debug;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to load configuration from {path}: {message}")]
    Extract { path: PathBuf, message: String },
}

/// Build a figment for `path`, with `<PREFIX>_` environment variables merged on top.
///
/// Nested keys use a double underscore: `GATEWAYSRV_LOGGING__LEVEL=debug`.
pub fn figment_for_file(path: &Path, env_prefix: Option<&str>) -> Result<Figment, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let figment = match extension.as_str() {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        other => return Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
    };

    Ok(match env_prefix {
        Some(prefix) => figment.merge(Env::prefixed(&format!("{}_", prefix)).split("__")),
        None => figment,
    })
}

/// Load configuration from a specific file with an optional environment overlay
pub fn load_config_from_file<T>(path: impl AsRef<Path>, env_prefix: Option<&str>) -> Result<T, ConfigLoadError>
where
    T: for<'de> Deserialize<'de>,
{
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());
    figment_for_file(path, env_prefix)?
        .extract()
        .map_err(|e| ConfigLoadError::Extract {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        port: u16,
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: demo\nport: 502").unwrap();

        let sample: Sample = load_config_from_file(file.path(), None).unwrap();
        assert_eq!(sample.name, "demo");
        assert_eq!(sample.port, 502);
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"name": "json-demo"}}"#).unwrap();

        let sample: Sample = load_config_from_file(file.path(), None).unwrap();
        assert_eq!(sample.name, "json-demo");
        assert_eq!(sample.port, 0);
    }

    #[test]
    fn test_missing_file() {
        let result: Result<Sample, _> = load_config_from_file("/nonexistent/cfg.yaml", None);
        assert!(matches!(result, Err(ConfigLoadError::NotFound(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result: Result<Sample, _> = load_config_from_file(file.path(), None);
        assert!(matches!(result, Err(ConfigLoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_missing_field_is_extract_error() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 1").unwrap();
        let result: Result<Sample, _> = load_config_from_file(file.path(), None);
        assert!(matches!(result, Err(ConfigLoadError::Extract { .. })));
    }
}
