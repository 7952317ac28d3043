//! Device templates
//!
//! A template describes one device model: its category, data points and
//! driver hints. Templates are read once from YAML files and shared between
//! all devices that reference them.

pub mod hints;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};
use crate::protocols::modbus::types::ModbusSource;
use crate::protocols::virt::VirtualSource;
use crate::value::{Value, ValueKind};

pub use hints::DriverHints;

/// Ids that would collide with the store layout under `devices.<id>.`
const RESERVED_IDS: [&str; 2] = ["aliases", "info"];

/// Device category; selects the alias vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    PvInverter,
    Meter,
    Battery,
    EvCharger,
    HeatPump,
    Io,
    Other,
}

impl DeviceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PvInverter => "pv_inverter",
            Self::Meter => "meter",
            Self::Battery => "battery",
            Self::EvCharger => "ev_charger",
            Self::HeatPump => "heat_pump",
            Self::Io => "io",
            Self::Other => "other",
        }
    }
}

/// Data point access mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Ro,
    Rw,
    Wo,
}

impl Access {
    pub fn is_readable(self) -> bool {
        !matches!(self, Self::Wo)
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Ro)
    }
}

/// One data point of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatapointDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rw: Access,
    #[serde(default)]
    pub kind: ValueKind,
    #[serde(default)]
    pub unit: Option<String>,
    /// Free-form role hint used by alias rules (e.g. `power`, `soc`)
    #[serde(default)]
    pub role: Option<String>,
    /// Decimal places kept after normalization
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub modbus: Option<ModbusSource>,
    #[serde(rename = "virtual", default)]
    pub virtual_source: Option<VirtualSource>,
    /// Opaque descriptor for drivers registered outside this crate
    #[serde(default)]
    pub external: Option<serde_json::Value>,
}

impl DatapointDef {
    /// Bare data point without a source
    pub fn new(id: impl Into<String>, rw: Access) -> Self {
        Self {
            id: id.into(),
            name: None,
            rw,
            kind: ValueKind::Number,
            unit: None,
            role: None,
            precision: None,
            modbus: None,
            virtual_source: None,
            external: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_readable(&self) -> bool {
        self.rw.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.rw.is_writable()
    }

    /// Value as published to the store
    pub fn normalize(&self, value: &Value) -> Value {
        value.normalized(self.kind, self.precision)
    }

    fn source_count(&self) -> usize {
        usize::from(self.modbus.is_some())
            + usize::from(self.virtual_source.is_some())
            + usize::from(self.external.is_some())
    }
}

/// Check that an id can be used as a store path segment
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A device model description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    pub id: String,
    pub category: DeviceCategory,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub datapoints: Vec<DatapointDef>,
    #[serde(default)]
    pub driver_hints: DriverHints,
}

impl Template {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let template: Template = serde_yaml::from_str(text)?;
        template.validate()?;
        Ok(template)
    }

    pub fn datapoint(&self, id: &str) -> Option<&DatapointDef> {
        self.datapoints.iter().find(|dp| dp.id == id)
    }

    /// Data points that appear in poll results
    pub fn readable(&self) -> impl Iterator<Item = &DatapointDef> {
        self.datapoints.iter().filter(|dp| dp.is_readable())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::config("Template id is empty"));
        }
        if self.datapoints.is_empty() {
            return Err(GatewayError::config(format!(
                "Template '{}' has no data points",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for dp in &self.datapoints {
            if !is_path_safe(&dp.id) {
                return Err(GatewayError::config(format!(
                    "Template '{}': data point id '{}' may only contain letters, digits, '_' and '-'",
                    self.id, dp.id
                )));
            }
            if RESERVED_IDS.contains(&dp.id.as_str()) {
                return Err(GatewayError::config(format!(
                    "Template '{}': data point id '{}' is reserved",
                    self.id, dp.id
                )));
            }
            if !seen.insert(dp.id.as_str()) {
                return Err(GatewayError::config(format!(
                    "Template '{}': duplicate data point id '{}'",
                    self.id, dp.id
                )));
            }
            if dp.source_count() > 1 {
                return Err(GatewayError::config(format!(
                    "Template '{}': data point '{}' declares more than one source",
                    self.id, dp.id
                )));
            }
            if let Some(source) = &dp.modbus {
                source.validate().map_err(|e| match e {
                    GatewayError::Codec(msg) => GatewayError::codec(format!(
                        "Template '{}', data point '{}': {}",
                        self.id, dp.id, msg
                    )),
                    other => other,
                })?;
            }
        }

        for dp in &self.datapoints {
            let Some(reference) = dp.modbus.as_ref().and_then(|s| s.scale_factor_ref.as_ref())
            else {
                continue;
            };
            let target = self.datapoint(reference).ok_or_else(|| {
                GatewayError::config(format!(
                    "Template '{}': '{}' references unknown scale factor '{}'",
                    self.id, dp.id, reference
                ))
            })?;
            let integer_register = target
                .modbus
                .as_ref()
                .is_some_and(|s| !s.is_bit_source() && s.data_type.is_integer());
            if !integer_register || !target.is_readable() {
                return Err(GatewayError::config(format!(
                    "Template '{}': scale factor '{}' must be a readable integer register",
                    self.id, reference
                )));
            }
        }

        self.driver_hints
            .validate(&self.datapoints)
            .map_err(|e| GatewayError::config(format!("Template '{}': {}", self.id, e.message())))
    }
}

/// Read-only template lookup by id
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, Arc<Template>>,
    rejected: Vec<(PathBuf, GatewayError)>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml`/`*.yml` file of a directory, one template per file.
    ///
    /// Invalid files are logged and recorded in [`TemplateCatalog::rejected`];
    /// devices referencing them fail with a configuration error.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            GatewayError::config(format!("Templates directory {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let mut catalog = Self::new();
        for path in paths {
            let loaded = std::fs::read_to_string(&path)
                .map_err(GatewayError::from)
                .and_then(|text| Template::from_yaml(&text))
                .and_then(|template| catalog.insert(template));
            match loaded {
                Ok(()) => debug!("Template loaded: {}", path.display()),
                Err(e) => {
                    error!("Template {} rejected: {}", path.display(), e);
                    catalog.rejected.push((path, e));
                },
            }
        }
        info!(
            "Templates: {} loaded, {} rejected",
            catalog.len(),
            catalog.rejected.len()
        );
        Ok(catalog)
    }

    /// Add a validated template; ids must be unique
    pub fn insert(&mut self, template: Template) -> Result<()> {
        template.validate()?;
        if self.templates.contains_key(&template.id) {
            return Err(GatewayError::config(format!(
                "Duplicate template id '{}'",
                template.id
            )));
        }
        self.templates
            .insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn rejected(&self) -> &[(PathBuf, GatewayError)] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
