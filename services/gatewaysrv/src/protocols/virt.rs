//! Virtual Protocol Implementation
//!
//! In-memory data points for running devices without hardware. Reads return
//! the last written (or initial) value; writes are stored as-is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::driver::Driver;
use crate::error::{GatewayError, Result};
use crate::protocols::registry::ProtocolFactory;
use crate::runtime::RuntimeContext;
use crate::template::{DatapointDef, Template};
use crate::value::{Value, ValueMap};

/// Source descriptor of a virtual data point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualSource {
    #[serde(default)]
    pub initial: Option<Value>,
}

/// Connection parameters of a virtual device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualParams {
    /// Simulated duration of every operation
    #[serde(default)]
    pub latency_ms: u64,
}

/// Shared view of a virtual device's memory
#[derive(Debug, Clone, Default)]
pub struct VirtualHandle {
    values: Arc<Mutex<ValueMap>>,
}

impl VirtualHandle {
    pub fn set(&self, id: &str, value: impl Into<Value>) {
        self.values.lock().insert(id.to_string(), value.into());
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.values.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> ValueMap {
        self.values.lock().clone()
    }
}

/// Virtual protocol driver
#[derive(Debug)]
pub struct VirtualDriver {
    device_id: String,
    memory: VirtualHandle,
    latency: Duration,
    connected: bool,
}

impl VirtualDriver {
    pub fn new(device_id: &str, template: &Template, params: &VirtualParams) -> Self {
        let memory = VirtualHandle::default();
        for dp in &template.datapoints {
            if let Some(initial) = dp.virtual_source.as_ref().and_then(|s| s.initial.clone()) {
                memory.set(&dp.id, initial);
            }
        }
        Self {
            device_id: device_id.to_string(),
            memory,
            latency: Duration::from_millis(params.latency_ms),
            connected: false,
        }
    }

    pub fn handle(&self) -> VirtualHandle {
        self.memory.clone()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Driver for VirtualDriver {
    fn protocol(&self) -> &str {
        "virtual"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.connected {
            self.connected = true;
            info!("[{}] Virtual device activated", self.device_id);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read_datapoints(&mut self, datapoints: &[&DatapointDef]) -> Result<ValueMap> {
        if !self.connected {
            return Err(GatewayError::not_connected());
        }
        self.simulate_latency().await;
        let memory = self.memory.values.lock();
        Ok(datapoints
            .iter()
            .filter(|dp| dp.is_readable())
            .filter_map(|dp| memory.get(&dp.id).map(|v| (dp.id.clone(), v.clone())))
            .collect())
    }

    async fn write_datapoint(&mut self, datapoint: &DatapointDef, value: &Value) -> Result<()> {
        if !self.connected {
            return Err(GatewayError::not_connected());
        }
        self.simulate_latency().await;
        debug!("[{}] {} <- {}", self.device_id, datapoint.id, value);
        self.memory.set(&datapoint.id, value.clone());
        Ok(())
    }
}

/// Factory for `virtual` devices
pub struct VirtualFactory;

#[async_trait]
impl ProtocolFactory for VirtualFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["virtual"]
    }

    async fn create(
        &self,
        _protocol: &str,
        device: &DeviceConfig,
        template: Arc<Template>,
        _ctx: &RuntimeContext,
    ) -> Result<Box<dyn Driver>> {
        let params: VirtualParams = device.connection_params()?;
        Ok(Box::new(VirtualDriver::new(&device.id, &template, &params)))
    }
}
