//! Shared serial buses
//!
//! Devices that share a serial line (same port and line settings) share one
//! [`SharedBus`]. The port opens lazily on the first transaction and closes
//! when the last holder releases its reference. All transactions on a bus go
//! through a single FIFO lock, so frames from different devices never
//! interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use super::connection::hex;
use super::frame::{parse_rtu_frame, rtu_frame, rtu_remaining_len};
use super::types::{ModbusRtuParams, Parity};
use crate::error::{ErrorExt, GatewayError, Result};

/// Identity of a serial line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusKey {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl From<&ModbusRtuParams> for BusKey {
    fn from(params: &ModbusRtuParams) -> Self {
        Self {
            port: params.port.clone(),
            baud_rate: params.baud_rate,
            parity: params.parity,
            data_bits: params.data_bits,
            stop_bits: params.stop_bits,
        }
    }
}

impl fmt::Display for BusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(
            f,
            "{}@{} {}{}{}",
            self.port, self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}

/// One physical serial line
pub struct SharedBus {
    key: BusKey,
    port: tokio::sync::Mutex<Option<SerialStream>>,
}

impl fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBus").field("key", &self.key).finish()
    }
}

impl SharedBus {
    fn new(key: BusKey) -> Self {
        Self {
            key,
            port: tokio::sync::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &BusKey {
        &self.key
    }

    fn open(&self) -> Result<SerialStream> {
        let key = &self.key;
        let parity = match key.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match key.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match key.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(&key.port, key.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .transport_error(&format!("open {}", key))?;
        info!("Serial bus opened: {}", key);
        Ok(stream)
    }

    /// Run one request/response exchange; waits its turn behind earlier callers
    pub async fn transact(&self, unit_id: u8, pdu: &[u8], io_timeout: Duration) -> Result<Vec<u8>> {
        let mut guard = self.port.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(GatewayError::not_connected());
        };

        match timeout(io_timeout, rtu_exchange(stream, unit_id, pdu)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if matches!(&e, GatewayError::Transport(_)) {
                    warn!("Serial bus {} failed, closing port: {}", self.key, e);
                    *guard = None;
                }
                Err(e)
            },
            Err(_) => {
                // Silent device; keep the port for the other devices on the line
                if let Err(e) = stream.clear(tokio_serial::ClearBuffer::Input) {
                    debug!("Serial input flush failed on {}: {}", self.key, e);
                }
                Err(GatewayError::timeout(format!(
                    "unit {} on {}",
                    unit_id, self.key
                )))
            },
        }
    }

    /// Close the port if open
    pub async fn close(&self) {
        if self.port.lock().await.take().is_some() {
            info!("Serial bus closed: {}", self.key);
        }
    }
}

async fn rtu_exchange(stream: &mut SerialStream, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
    let request = rtu_frame(unit_id, pdu);
    trace!("TX {}", hex(&request));
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut frame = vec![0u8; 3];
    stream.read_exact(&mut frame).await?;
    let remaining = rtu_remaining_len(frame[1], Some(frame[2])).unwrap_or(2);
    // `remaining` counts from the third byte
    let total = 2 + remaining;
    if total > 3 {
        frame.resize(total, 0);
        stream.read_exact(&mut frame[3..]).await?;
    }
    trace!("RX {}", hex(&frame));

    let (received_unit, response) = parse_rtu_frame(&frame)?;
    if received_unit != unit_id {
        return Err(GatewayError::protocol(format!(
            "Unit id mismatch: sent {}, got {}",
            unit_id, received_unit
        )));
    }
    Ok(response.to_vec())
}

/// Reference-counted registry of shared buses, owned by the runtime context
#[derive(Debug, Default)]
pub struct BusRegistry {
    buses: Mutex<HashMap<BusKey, (Arc<SharedBus>, usize)>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on the bus for `key`, creating it if needed
    pub fn acquire(&self, key: &BusKey) -> Arc<SharedBus> {
        let mut buses = self.buses.lock();
        let entry = buses
            .entry(key.clone())
            .or_insert_with(|| (Arc::new(SharedBus::new(key.clone())), 0));
        entry.1 += 1;
        debug!("Bus {} acquired ({} holders)", key, entry.1);
        entry.0.clone()
    }

    /// Drop a reference; the last release removes the bus and closes its port
    pub fn release(&self, key: &BusKey) {
        let mut buses = self.buses.lock();
        let remove = match buses.get_mut(key) {
            Some(entry) => {
                entry.1 = entry.1.saturating_sub(1);
                entry.1 == 0
            },
            None => false,
        };
        if remove {
            if let Some((bus, _)) = buses.remove(key) {
                debug!("Bus {} released by last holder", key);
                // The port closes when the final Arc drops; close eagerly when possible
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { bus.close().await });
                }
            }
        }
    }

    pub fn holders(&self, key: &BusKey) -> usize {
        self.buses.lock().get(key).map(|(_, n)| *n).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.lock().is_empty()
    }
}
