//! Modbus source descriptors and connection parameters

use serde::{Deserialize, Serialize};

use super::constants::{is_bit_function, is_read_function, MAX_READ_REGISTERS};
use crate::error::{GatewayError, Result};

/// Register data type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Bool,
    Int8,
    Uint8,
    Int16,
    #[default]
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    #[serde(alias = "ascii")]
    String,
}

impl RegisterType {
    /// Register count implied by the type (`None` for variable width strings)
    pub fn fixed_registers(self) -> Option<u16> {
        match self {
            Self::Bool | Self::Int8 | Self::Uint8 | Self::Int16 | Self::Uint16 => Some(1),
            Self::Int32 | Self::Uint32 | Self::Float32 => Some(2),
            Self::Int64 | Self::Uint64 | Self::Float64 => Some(4),
            Self::String => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Uint8
                | Self::Int16
                | Self::Uint16
                | Self::Int32
                | Self::Uint32
                | Self::Int64
                | Self::Uint64
        )
    }
}

/// Order of registers within a multi-register value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Most significant register first
    #[default]
    #[serde(alias = "big", alias = "be", alias = "msw")]
    HighFirst,
    /// Least significant register first
    #[serde(alias = "little", alias = "le", alias = "lsw")]
    LowFirst,
}

/// Order of the two bytes inside each register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = "big", alias = "be")]
    BigEndian,
    #[serde(alias = "little", alias = "le", alias = "swap")]
    LittleEndian,
}

/// Where a data point lives on a Modbus device and how it is encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusSource {
    /// Read function code (1-4); the write function code is derived from it
    #[serde(alias = "fc")]
    pub function_code: u8,
    pub address: u16,
    /// Register count; defaults to the width of `type`
    #[serde(default)]
    pub length: Option<u16>,
    #[serde(rename = "type", default)]
    pub data_type: RegisterType,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Static multiplier applied after decoding
    #[serde(default)]
    pub scale: Option<f64>,
    /// Added after scaling
    #[serde(default)]
    pub offset: Option<f64>,
    /// Id of the data point carrying a power-of-ten scale factor
    #[serde(default)]
    pub scale_factor_ref: Option<String>,
    /// Bit index for booleans packed into a register
    #[serde(default)]
    pub bit: Option<u8>,
    /// Overrides the device unit id for this point
    #[serde(default)]
    pub unit_id: Option<u8>,
    /// Force FC16 even for single-register values
    #[serde(default)]
    pub write_multiple: bool,
}

impl ModbusSource {
    /// Number of registers (or bits for FC1/FC2) this value occupies
    pub fn quantity(&self) -> u16 {
        if is_bit_function(self.function_code) {
            return 1;
        }
        self.length
            .or_else(|| self.data_type.fixed_registers())
            .unwrap_or(1)
    }

    pub fn is_bit_source(&self) -> bool {
        is_bit_function(self.function_code)
    }

    /// Holding registers and coils accept writes
    pub fn is_writable_area(&self) -> bool {
        matches!(self.function_code, 1 | 3)
    }

    /// Structural checks done once at template load
    pub fn validate(&self) -> Result<()> {
        if !is_read_function(self.function_code) {
            return Err(GatewayError::unsupported(format!(
                "Modbus function code {} (supported: 1, 2, 3, 4)",
                self.function_code
            )));
        }

        if self.is_bit_source() {
            if self.data_type != RegisterType::Bool {
                return Err(GatewayError::codec(format!(
                    "FC{:02} at {} must use type bool, got {:?}",
                    self.function_code, self.address, self.data_type
                )));
            }
            return Ok(());
        }

        if let Some(bit) = self.bit {
            if bit > 15 || self.data_type != RegisterType::Bool {
                return Err(GatewayError::codec(format!(
                    "Bit {} at {} requires type bool and index 0-15",
                    bit, self.address
                )));
            }
        }

        match (self.data_type.fixed_registers(), self.length) {
            (None, None) => {
                return Err(GatewayError::codec(format!(
                    "String at {} requires a length",
                    self.address
                )))
            },
            (Some(fixed), Some(len)) if fixed != len => {
                return Err(GatewayError::codec(format!(
                    "{:?} at {} occupies {} registers, length says {}",
                    self.data_type, self.address, fixed, len
                )))
            },
            _ => {},
        }

        let quantity = self.quantity();
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(GatewayError::codec(format!(
                "Register length {} at {} out of range 1-{}",
                quantity, self.address, MAX_READ_REGISTERS
            )));
        }
        if u32::from(self.address) + u32::from(quantity) > 0x1_0000 {
            return Err(GatewayError::codec(format!(
                "Range {}+{} exceeds the register address space",
                self.address, quantity
            )));
        }

        if let Some(scale) = self.scale {
            if scale == 0.0 || !scale.is_finite() {
                return Err(GatewayError::codec(format!(
                    "Scale at {} must be finite and non-zero",
                    self.address
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Connection parameters
// ============================================================================

fn default_tcp_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_tcp_timeout_ms() -> u64 {
    3000
}

fn default_rtu_timeout_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Modbus TCP connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusTcpParams {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_tcp_timeout_ms")]
    pub timeout_ms: u64,
    /// Probe for the SunSpec marker and offset template addresses
    #[serde(default)]
    pub sunspec: bool,
}

/// Serial parity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Modbus RTU connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusRtuParams {
    /// Serial device path (e.g. /dev/ttyUSB0)
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_rtu_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub sunspec: bool,
}

impl ModbusRtuParams {
    pub fn validate(&self) -> Result<()> {
        if !(5..=8).contains(&self.data_bits) {
            return Err(GatewayError::config(format!(
                "data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(GatewayError::config(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.baud_rate == 0 {
            return Err(GatewayError::config("baud_rate must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn source(yaml: &str) -> ModbusSource {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_source_with_aliases() {
        let src = source("fc: 3\naddress: 40072\ntype: int32\nword_order: lsw\nbyte_order: be");
        assert_eq!(src.function_code, 3);
        assert_eq!(src.data_type, RegisterType::Int32);
        assert_eq!(src.word_order, WordOrder::LowFirst);
        assert_eq!(src.byte_order, ByteOrder::BigEndian);
        assert_eq!(src.quantity(), 2);
        src.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<ModbusSource, _> =
            serde_yaml::from_str("fc: 3\naddress: 1\nregister_kind: holding");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_function_code() {
        let src = source("fc: 7\naddress: 0");
        assert!(matches!(
            src.validate(),
            Err(GatewayError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_validate_length_mismatch() {
        let src = source("fc: 3\naddress: 0\ntype: float32\nlength: 4");
        assert!(matches!(src.validate(), Err(GatewayError::Codec(_))));

        let src = source("fc: 3\naddress: 0\ntype: string");
        assert!(matches!(src.validate(), Err(GatewayError::Codec(_))));

        let src = source("fc: 3\naddress: 0\ntype: ascii\nlength: 8");
        assert_eq!(src.quantity(), 8);
        src.validate().unwrap();
    }

    #[test]
    fn test_validate_coil_type() {
        let src = source("fc: 1\naddress: 10\ntype: bool");
        assert_eq!(src.quantity(), 1);
        src.validate().unwrap();

        let src = source("fc: 2\naddress: 10\ntype: uint16");
        assert!(src.validate().is_err());
    }

    #[test]
    fn test_validate_address_overflow() {
        let src = source("fc: 3\naddress: 65535\ntype: uint32");
        assert!(src.validate().is_err());
    }

    #[test]
    fn test_rtu_params_defaults() {
        let params: ModbusRtuParams = serde_json::from_value(serde_json::json!({
            "port": "/dev/ttyUSB0"
        }))
        .unwrap();
        assert_eq!(params.baud_rate, 9600);
        assert_eq!(params.parity, Parity::None);
        assert_eq!(params.unit_id, 1);
        params.validate().unwrap();
    }
}
