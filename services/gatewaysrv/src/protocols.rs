//! Protocol implementations

pub mod modbus;
pub mod registry;
pub mod virt;

pub use registry::{create_default_registry, normalize_protocol_name, ProtocolFactory, ProtocolRegistry};
