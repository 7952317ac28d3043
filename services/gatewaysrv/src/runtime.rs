//! Device runtime
//!
//! Scheduling, write queueing, watchdog and store publication for running
//! devices.

pub mod context;
pub mod device;
pub mod gateway;
pub mod logger;
pub mod prewrite;
pub mod schedule;
pub mod watchdog;
pub mod write_queue;

pub use context::RuntimeContext;
pub use device::{DeviceRuntime, WriteMode};
pub use gateway::{check_devices, Gateway};
pub use write_queue::{AckTarget, WriteEntry, WriteQueue, MAX_WRITE_ATTEMPTS};
