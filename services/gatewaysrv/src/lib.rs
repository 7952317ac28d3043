//! Gateway Service Library (gatewaysrv)
//!
//! Connects field devices (Modbus TCP/RTU, virtual devices, and protocols
//! registered at runtime) to a hierarchical state store. Every device is
//! described by a template: its data points, how they map onto the wire, and
//! driver hints that tune polling, writes and the watchdog.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   AppConfig     │───►│ ProtocolRegistry│───►│  Drivers        │
//! │   (YAML + env)  │    │   (factories)   │    │  (TCP/RTU/...)  │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                                             │
//!          ▼                                             ▼
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ TemplateCatalog │───►│ DeviceRuntime   │───►│   StateStore    │
//! │ + alias rules   │    │ poll/write/wdg  │    │ values/aliases  │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`template`**: device model descriptions and typed driver hints
//! - **`protocols`**: Modbus and virtual drivers behind the [`driver::Driver`] contract
//! - **`alias`**: protocol independent view of each device
//! - **`runtime`**: per-device scheduler, write queue, watchdog, gateway
//! - **`store`**: state store contract plus an in-memory implementation

pub mod alias;
pub mod config;
pub mod driver;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod store;
pub mod template;
pub mod value;

pub use config::{AppConfig, DeviceConfig};
pub use driver::Driver;
pub use error::{GatewayError, Result};
pub use runtime::{DeviceRuntime, Gateway, RuntimeContext};
pub use store::{MemoryStore, StateStore};
pub use template::{Template, TemplateCatalog};
pub use value::{Value, ValueMap};
