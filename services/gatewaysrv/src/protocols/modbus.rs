//! Modbus Protocol Implementation
//!
//! Supports both Modbus TCP and Modbus RTU over shared serial buses

pub mod batcher;
pub mod bus;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod driver;
pub mod frame;
pub mod scale;
pub mod types;

// Re-export commonly used types
pub use bus::{BusKey, BusRegistry};
pub use driver::{ModbusDriver, ModbusFactory};
pub use scale::ScaleFactorRegistry;
pub use types::*;
