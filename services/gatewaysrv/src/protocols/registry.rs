//! Protocol Registry Module
//!
//! Maps protocol names to driver factories. Adding a protocol means
//! implementing [`ProtocolFactory`] and registering it, either in
//! [`create_default_registry`] or at runtime on the context's registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::DeviceConfig;
use crate::driver::Driver;
use crate::error::{GatewayError, Result};
use crate::protocols::modbus::ModbusFactory;
use crate::protocols::virt::VirtualFactory;
use crate::runtime::RuntimeContext;
use crate::template::Template;

// ============================================================================
// Protocol Factory Trait
// ============================================================================

/// Creates driver instances for one or more protocol names
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    /// Normalized names handled by this factory
    fn protocol_names(&self) -> &'static [&'static str];

    /// Create the driver of one device.
    ///
    /// `protocol` is the normalized name the device was configured with.
    async fn create(
        &self,
        protocol: &str,
        device: &DeviceConfig,
        template: Arc<Template>,
        ctx: &RuntimeContext,
    ) -> Result<Box<dyn Driver>>;
}

/// Normalize protocol name variations to the registered spelling
pub fn normalize_protocol_name(name: &str) -> String {
    let cleaned = name.trim().to_lowercase();
    let normalized = cleaned.replace(['-', ' ', '.'], "_");

    match normalized.as_str() {
        "modbus_tcp" | "modbustcp" => "modbus_tcp".to_string(),
        "modbus_rtu" | "modbusrtu" => "modbus_rtu".to_string(),
        "modbus_ascii" | "modbusascii" => "modbus_ascii".to_string(),
        "virtual" | "virt" | "virtual_protocol" => "virtual".to_string(),
        _ => normalized,
    }
}

// ============================================================================
// Protocol Registry
// ============================================================================

/// Protocol registry owned by the runtime context
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: DashMap<String, Arc<dyn ProtocolFactory>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.registered_protocols())
            .finish()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every name declared by the factory; later registrations win
    pub fn register(&self, factory: Arc<dyn ProtocolFactory>) {
        for name in factory.protocol_names() {
            self.factories
                .insert(normalize_protocol_name(name), factory.clone());
        }
    }

    /// Create a driver for a device; unknown protocols are configuration errors
    pub async fn create(
        &self,
        device: &DeviceConfig,
        template: Arc<Template>,
        ctx: &RuntimeContext,
    ) -> Result<Box<dyn Driver>> {
        let normalized = normalize_protocol_name(&device.protocol);
        // Clone out of the map so no shard lock is held across the await
        let factory = self
            .factories
            .get(&normalized)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                GatewayError::config(format!(
                    "Device '{}': unknown protocol '{}'",
                    device.id, device.protocol
                ))
            })?;
        factory.create(&normalized, device, template, ctx).await
    }

    pub fn is_registered(&self, protocol_name: &str) -> bool {
        self.factories
            .contains_key(&normalize_protocol_name(protocol_name))
    }

    pub fn registered_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}

/// Registry with the built-in protocols
pub fn create_default_registry() -> ProtocolRegistry {
    let registry = ProtocolRegistry::new();
    registry.register(Arc::new(ModbusFactory));
    registry.register(Arc::new(VirtualFactory));
    registry
}
