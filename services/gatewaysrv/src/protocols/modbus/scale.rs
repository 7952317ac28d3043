//! Scale factor resolution
//!
//! SunSpec-style models publish power-of-ten exponents in separate int16
//! registers. Values referencing one are multiplied by `10^sf` after raw
//! decoding. The cache is filled from ordinary reads of those registers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::constants::SCALE_FACTOR_NOT_IMPLEMENTED;
use super::types::ModbusSource;
use crate::error::{GatewayError, Result};
use crate::value::Value;

/// Scale factor exponents of one device, keyed by data point id
#[derive(Debug, Default, Clone)]
pub struct ScaleFactorCache {
    factors: HashMap<String, i16>,
}

impl ScaleFactorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly read scale factor value
    pub fn update(&mut self, id: &str, value: &Value) {
        if let Some(raw) = value.as_i64() {
            if let Ok(sf) = i16::try_from(raw) {
                self.factors.insert(id.to_string(), sf);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<i16> {
        self.factors.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factors.contains_key(id)
    }

    /// Combined multiplier for a source: static scale times `10^sf`.
    ///
    /// A scale factor of -32768 means "not implemented" and contributes nothing.
    /// A referenced factor that was never read is a codec error.
    pub fn multiplier(&self, source: &ModbusSource) -> Result<f64> {
        let base = source.scale.unwrap_or(1.0);
        let Some(reference) = &source.scale_factor_ref else {
            return Ok(base);
        };
        match self.get(reference) {
            None => Err(GatewayError::codec(format!(
                "Scale factor '{}' not available yet",
                reference
            ))),
            Some(SCALE_FACTOR_NOT_IMPLEMENTED) => Ok(base),
            Some(sf) => Ok(base * 10f64.powi(i32::from(sf))),
        }
    }

    pub fn clear(&mut self) {
        self.factors.clear();
    }
}

/// Per-device scale factor caches owned by the runtime context
#[derive(Debug, Default)]
pub struct ScaleFactorRegistry {
    devices: DashMap<String, Arc<Mutex<ScaleFactorCache>>>,
}

impl ScaleFactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache handle for a device, created on first use
    pub fn cache_for(&self, device_id: &str) -> Arc<Mutex<ScaleFactorCache>> {
        self.devices
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget a device's factors (on device removal)
    pub fn remove(&self, device_id: &str) {
        self.devices.remove(device_id);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::modbus::types::RegisterType;

    fn source_with_ref(reference: &str) -> ModbusSource {
        serde_yaml::from_str(&format!(
            "fc: 3\naddress: 40083\ntype: int16\nscale_factor_ref: {}",
            reference
        ))
        .unwrap()
    }

    #[test]
    fn test_multiplier_from_exponent() {
        let mut cache = ScaleFactorCache::new();
        cache.update("W_SF", &Value::Int(-1));
        let m = cache.multiplier(&source_with_ref("W_SF")).unwrap();
        assert!((m - 0.1).abs() < 1e-12);

        cache.update("W_SF", &Value::Int(2));
        assert_eq!(cache.multiplier(&source_with_ref("W_SF")).unwrap(), 100.0);
    }

    #[test]
    fn test_not_implemented_factor_ignored() {
        let mut cache = ScaleFactorCache::new();
        cache.update("W_SF", &Value::Int(i64::from(SCALE_FACTOR_NOT_IMPLEMENTED)));
        assert_eq!(cache.multiplier(&source_with_ref("W_SF")).unwrap(), 1.0);
    }

    #[test]
    fn test_missing_factor_is_codec_error() {
        let cache = ScaleFactorCache::new();
        assert!(matches!(
            cache.multiplier(&source_with_ref("A_SF")),
            Err(GatewayError::Codec(_))
        ));
    }

    #[test]
    fn test_static_scale_combines() {
        let mut cache = ScaleFactorCache::new();
        cache.update("V_SF", &Value::Int(-2));
        let mut source = source_with_ref("V_SF");
        source.scale = Some(10.0);
        source.data_type = RegisterType::Uint16;
        let m = cache.multiplier(&source).unwrap();
        assert!((m - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_registry_isolates_devices() {
        let registry = ScaleFactorRegistry::new();
        registry.cache_for("inv1").lock().update("W_SF", &Value::Int(1));
        assert!(registry.cache_for("inv1").lock().contains("W_SF"));
        assert!(!registry.cache_for("inv2").lock().contains("W_SF"));
        assert_eq!(registry.len(), 2);
        registry.remove("inv2");
        assert_eq!(registry.len(), 1);
    }
}
