//! Driver contract
//!
//! Every protocol plugs into the device scheduler through [`Driver`]. A driver
//! instance belongs to exactly one device and is only ever called by that
//! device's scheduler, one operation at a time.

use async_trait::async_trait;

use crate::error::Result;
use crate::template::DatapointDef;
use crate::value::{Value, ValueMap};

/// Protocol driver of one device
#[async_trait]
pub trait Driver: Send {
    /// Normalized protocol name (`modbus_tcp`, `virtual`, ...)
    fn protocol(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Open the link; calling it on a connected driver is a no-op
    async fn connect(&mut self) -> Result<()>;

    /// Close the link; never fails
    async fn disconnect(&mut self);

    /// Read the given data points.
    ///
    /// Data points that could not be decoded are left out of the result;
    /// a link failure fails the whole call.
    async fn read_datapoints(&mut self, datapoints: &[&DatapointDef]) -> Result<ValueMap>;

    /// Write one device-native value
    async fn write_datapoint(&mut self, datapoint: &DatapointDef, value: &Value) -> Result<()>;
}
