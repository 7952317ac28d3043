//! Modbus driver
//!
//! Reads are planned with the batcher, decoded from the assembled register
//! image and scaled with the device's scale factor cache. Writes reverse the
//! scaling and use FC05, FC06 or FC16.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::batcher::{plan_spans, BatchLimits, ReadRequest, RegisterImage};
use super::bus::BusKey;
use super::codec::{apply_scale, decode_registers, encode_value, remove_scale};
use super::connection::{ModbusLink, SerialLink, TcpLink};
use super::constants::{
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, SUNSPEC_BASE_ADDRESSES, SUNSPEC_MARKER,
};
use super::frame;
use super::scale::ScaleFactorCache;
use super::types::{ModbusRtuParams, ModbusSource, ModbusTcpParams};
use crate::config::DeviceConfig;
use crate::driver::Driver;
use crate::error::{GatewayError, Result};
use crate::protocols::registry::ProtocolFactory;
use crate::runtime::RuntimeContext;
use crate::template::{DatapointDef, Template};
use crate::value::{Value, ValueMap};

/// Modbus TCP/RTU driver of one device
pub struct ModbusDriver {
    protocol: &'static str,
    device_id: String,
    template: Arc<Template>,
    link: ModbusLink,
    unit_id: u8,
    sunspec: bool,
    /// Added to every template address once SunSpec discovery succeeded
    address_offset: Option<u16>,
    limits: BatchLimits,
    scale_factors: Arc<Mutex<ScaleFactorCache>>,
}

impl std::fmt::Debug for ModbusDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusDriver")
            .field("protocol", &self.protocol)
            .field("device_id", &self.device_id)
            .field("link", &self.link.describe())
            .field("unit_id", &self.unit_id)
            .field("address_offset", &self.address_offset)
            .finish()
    }
}

/// A data point resolved to physical addresses
struct Located<'a> {
    dp: &'a DatapointDef,
    source: &'a ModbusSource,
    unit_id: u8,
    address: u16,
}

impl ModbusDriver {
    fn new(
        protocol: &'static str,
        device_id: &str,
        template: Arc<Template>,
        link: ModbusLink,
        unit_id: u8,
        sunspec: bool,
        scale_factors: Arc<Mutex<ScaleFactorCache>>,
    ) -> Self {
        let hints = &template.driver_hints.modbus;
        let limits = BatchLimits {
            max_registers: hints.max_read_registers,
            max_bits: hints.max_read_bits,
            max_gap: hints.max_gap,
        };
        Self {
            protocol,
            device_id: device_id.to_string(),
            template,
            link,
            unit_id,
            sunspec,
            address_offset: None,
            limits,
            scale_factors,
        }
    }

    /// Create a Modbus TCP driver
    pub fn tcp(
        device_id: &str,
        template: Arc<Template>,
        params: &ModbusTcpParams,
        scale_factors: Arc<Mutex<ScaleFactorCache>>,
    ) -> Self {
        let link = ModbusLink::Tcp(TcpLink::new(
            &params.host,
            params.port,
            Duration::from_millis(params.timeout_ms),
        ));
        Self::new(
            "modbus_tcp",
            device_id,
            template,
            link,
            params.unit_id,
            params.sunspec,
            scale_factors,
        )
    }

    /// Create a Modbus RTU driver on a shared serial bus
    pub fn rtu(
        device_id: &str,
        template: Arc<Template>,
        params: &ModbusRtuParams,
        ctx: &RuntimeContext,
        scale_factors: Arc<Mutex<ScaleFactorCache>>,
    ) -> Result<Self> {
        params.validate()?;
        let link = ModbusLink::Serial(SerialLink::new(
            BusKey::from(params),
            Duration::from_millis(params.timeout_ms),
            ctx.buses.clone(),
        ));
        Ok(Self::new(
            "modbus_rtu",
            device_id,
            template,
            link,
            params.unit_id,
            params.sunspec,
            scale_factors,
        ))
    }

    pub fn address_offset(&self) -> u16 {
        self.address_offset.unwrap_or(0)
    }

    fn locate<'a>(&self, dp: &'a DatapointDef) -> Result<Located<'a>> {
        let source = dp.modbus.as_ref().ok_or_else(|| {
            GatewayError::config(format!("Data point '{}' has no modbus source", dp.id))
        })?;
        let address = u32::from(source.address) + u32::from(self.address_offset());
        if address + u32::from(source.quantity()) > 0x1_0000 {
            return Err(GatewayError::codec(format!(
                "Data point '{}': address {} beyond the register space",
                dp.id, address
            )));
        }
        Ok(Located {
            dp,
            source,
            unit_id: source.unit_id.unwrap_or(self.unit_id),
            address: address as u16,
        })
    }

    /// Probe the SunSpec base addresses for the "SunS" marker
    async fn discover_sunspec(&mut self) -> Result<u16> {
        for base in SUNSPEC_BASE_ADDRESSES {
            let pdu = frame::read_request(FC_READ_HOLDING_REGISTERS, base, 2);
            let response = match self.link.transact(self.unit_id, &pdu).await {
                Ok(response) => response,
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    debug!("[{}] No SunSpec marker at {}: {}", self.device_id, base, e);
                    continue;
                },
            };
            let words = frame::parse_read_response(FC_READ_HOLDING_REGISTERS, 2, &response);
            if matches!(words.as_deref(), Ok(w) if w == &SUNSPEC_MARKER[..]) {
                info!("[{}] SunSpec marker found at {}", self.device_id, base);
                return Ok(base + 2);
            }
        }
        Err(GatewayError::protocol(format!(
            "SunSpec marker not found at {:?}",
            SUNSPEC_BASE_ADDRESSES
        )))
    }
}

#[async_trait]
impl Driver for ModbusDriver {
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.link.is_connected() {
            return Ok(());
        }
        self.link.connect().await?;
        if self.sunspec {
            match self.discover_sunspec().await {
                Ok(offset) => self.address_offset = Some(offset),
                Err(e) => {
                    self.link.disconnect();
                    return Err(e);
                },
            }
        }
        info!("[{}] Connected to {}", self.device_id, self.link.describe());
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.link.is_connected() {
            info!("[{}] Disconnected from {}", self.device_id, self.link.describe());
        }
        self.link.disconnect();
        self.address_offset = None;
    }

    async fn read_datapoints(&mut self, datapoints: &[&DatapointDef]) -> Result<ValueMap> {
        let template = self.template.clone();

        // Scale factors referenced by the requested points are read alongside them
        let mut wanted: Vec<&DatapointDef> = datapoints.to_vec();
        let mut ids: HashSet<&str> = wanted.iter().map(|dp| dp.id.as_str()).collect();
        let references: HashSet<&str> = datapoints
            .iter()
            .filter_map(|dp| dp.modbus.as_ref()?.scale_factor_ref.as_deref())
            .collect();
        for reference in &references {
            if let Some(dp) = template.datapoint(reference) {
                if ids.insert(dp.id.as_str()) {
                    wanted.push(dp);
                }
            }
        }

        let mut located = Vec::with_capacity(wanted.len());
        for dp in wanted.iter().filter(|dp| dp.is_readable()) {
            match self.locate(dp) {
                Ok(loc) => located.push(loc),
                Err(e) => debug!("[{}] Skipping '{}': {}", self.device_id, dp.id, e),
            }
        }
        if located.is_empty() {
            return Ok(ValueMap::new());
        }

        let requests: Vec<ReadRequest> = located
            .iter()
            .map(|loc| ReadRequest {
                unit_id: loc.unit_id,
                function_code: loc.source.function_code,
                start: loc.address,
                count: loc.source.quantity(),
            })
            .collect();
        let spans = plan_spans(&requests, &self.limits);

        let mut image = RegisterImage::new();
        let mut first_error = None;
        for span in &spans {
            let pdu = frame::read_request(span.function_code, span.start, span.count);
            let result = match self.link.transact(span.unit_id, &pdu).await {
                Ok(response) => frame::parse_read_response(span.function_code, span.count, &response),
                Err(e) => Err(e),
            };
            match result {
                Ok(words) => image.insert_span(span, &words),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] FC{:02} {}+{} failed: {}",
                        self.device_id, span.function_code, span.start, span.count, e
                    );
                    first_error.get_or_insert(e);
                },
            }
        }
        if image.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let mut raw_values = Vec::with_capacity(located.len());
        for loc in &located {
            let Some(words) = image.get(
                loc.unit_id,
                loc.source.function_code,
                loc.address,
                loc.source.quantity(),
            ) else {
                continue;
            };
            match decode_registers(&words, loc.source) {
                Ok(raw) => raw_values.push((loc, raw)),
                Err(e) => debug!("[{}] Decode '{}' failed: {}", self.device_id, loc.dp.id, e),
            }
        }

        let mut cache = self.scale_factors.lock();
        for (loc, raw) in &raw_values {
            if references.contains(loc.dp.id.as_str()) {
                cache.update(&loc.dp.id, raw);
            }
        }

        let mut values = ValueMap::new();
        for (loc, raw) in raw_values {
            match cache.multiplier(loc.source) {
                Ok(multiplier) => {
                    values.insert(loc.dp.id.clone(), apply_scale(raw, loc.source, multiplier));
                },
                Err(e) => debug!("[{}] '{}' omitted: {}", self.device_id, loc.dp.id, e),
            }
        }
        Ok(values)
    }

    async fn write_datapoint(&mut self, datapoint: &DatapointDef, value: &Value) -> Result<()> {
        let loc = self.locate(datapoint)?;
        let source = loc.source;
        if !source.is_writable_area() {
            return Err(GatewayError::unsupported(format!(
                "Data point '{}' lives in read-only area FC{:02}",
                datapoint.id, source.function_code
            )));
        }

        let multiplier = self.scale_factors.lock().multiplier(source)?;
        let raw = remove_scale(value, source, multiplier)?;

        let (function_code, pdu) = if source.is_bit_source() {
            let on = raw.as_bool().ok_or_else(|| {
                GatewayError::codec(format!("'{}' expects a boolean, got {}", datapoint.id, raw))
            })?;
            (FC_WRITE_SINGLE_COIL, frame::write_single_coil(loc.address, on))
        } else {
            let words = encode_value(&raw, source)?;
            if words.len() == 1 && !source.write_multiple {
                (
                    FC_WRITE_SINGLE_REGISTER,
                    frame::write_single_register(loc.address, words[0]),
                )
            } else {
                (
                    FC_WRITE_MULTIPLE_REGISTERS,
                    frame::write_multiple_registers(loc.address, &words)?,
                )
            }
        };

        let response = self.link.transact(loc.unit_id, &pdu).await?;
        frame::check_write_response(function_code, loc.address, &response)?;
        debug!(
            "[{}] FC{:02} {} <- {}",
            self.device_id, function_code, loc.address, value
        );
        Ok(())
    }
}

/// Factory for `modbus_tcp` and `modbus_rtu` devices
pub struct ModbusFactory;

#[async_trait]
impl ProtocolFactory for ModbusFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["modbus_tcp", "modbus_rtu"]
    }

    async fn create(
        &self,
        protocol: &str,
        device: &DeviceConfig,
        template: Arc<Template>,
        ctx: &RuntimeContext,
    ) -> Result<Box<dyn Driver>> {
        let scale_factors = ctx.scale_factors.cache_for(&device.id);
        match protocol {
            "modbus_tcp" => {
                let params: ModbusTcpParams = device.connection_params()?;
                Ok(Box::new(ModbusDriver::tcp(
                    &device.id,
                    template,
                    &params,
                    scale_factors,
                )))
            },
            "modbus_rtu" => {
                let params: ModbusRtuParams = device.connection_params()?;
                Ok(Box::new(ModbusDriver::rtu(
                    &device.id,
                    template,
                    &params,
                    ctx,
                    scale_factors,
                )?))
            },
            other => Err(GatewayError::config(format!(
                "Modbus variant '{}' is not supported",
                other
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn template() -> Arc<Template> {
        Arc::new(
            Template::from_yaml(
                "id: t\ncategory: meter\ndatapoints:\n  - id: power\n    modbus: { fc: 4, address: 10, type: int16 }\n  - id: setpoint\n    rw: rw\n    modbus: { fc: 3, address: 100 }\n",
            )
            .unwrap(),
        )
    }

    fn driver() -> ModbusDriver {
        let params: ModbusTcpParams =
            serde_json::from_value(serde_json::json!({ "host": "127.0.0.1", "port": 1 })).unwrap();
        ModbusDriver::tcp("m1", template(), &params, Arc::default())
    }

    #[tokio::test]
    async fn test_write_to_input_register_unsupported() {
        let mut driver = driver();
        let template = template();
        let dp = template.datapoint("power").unwrap();
        let err = driver.write_datapoint(dp, &Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_write_without_connection_is_transport() {
        let mut driver = driver();
        let template = template();
        let dp = template.datapoint("setpoint").unwrap();
        let err = driver.write_datapoint(dp, &Value::Int(1)).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_write_out_of_range_is_codec_before_send() {
        let mut driver = driver();
        let template = template();
        let dp = template.datapoint("setpoint").unwrap();
        let err = driver
            .write_datapoint(dp, &Value::Int(70_000))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn test_address_offset_applied() {
        let mut driver = driver();
        driver.address_offset = Some(40002);
        let template = template();
        let loc = driver.locate(template.datapoint("setpoint").unwrap()).unwrap();
        assert_eq!(loc.address, 40102);
        assert_eq!(loc.unit_id, 1);
    }

    #[test]
    fn test_debug_shows_link() {
        let driver = driver();
        assert!(format!("{:?}", driver).contains("127.0.0.1:1"));
        assert_eq!(driver.protocol(), "modbus_tcp");
    }
}
