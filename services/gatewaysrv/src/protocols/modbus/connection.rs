//! Modbus links
//!
//! A TCP link is owned by one device. Serial links go through a shared bus
//! handle so several devices on one RS485 line never interleave frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::bus::{BusKey, BusRegistry, SharedBus};
use super::constants::MBAP_HEADER_LEN;
use super::frame::{parse_mbap_header, tcp_frame};
use crate::error::{ErrorExt, GatewayError, Result};

/// Stale responses skipped before a TCP transaction gives up
const MAX_STALE_RESPONSES: usize = 3;

/// Hex dump for frame tracing
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Modbus TCP link
#[derive(Debug)]
pub struct TcpLink {
    address: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    next_transaction_id: u16,
}

impl TcpLink {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            timeout,
            stream: None,
            next_transaction_id: 1,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!("TCP connecting: {}", self.address);
        let stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| GatewayError::timeout(format!("connect {}", self.address)))?
            .transport_error(&format!("connect {}", self.address))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP_NODELAY failed for {}: {}", self.address, e);
        }
        self.stream = Some(stream);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("TCP closed: {}", self.address);
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Send one request PDU and return the response PDU
    ///
    /// Any link failure drops the socket; the caller sees a transport error.
    pub async fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        let transaction_id = self.next_transaction_id();
        let result = self.exchange(transaction_id, unit_id, pdu).await;
        if matches!(&result, Err(e) if e.is_transport()) {
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        let io_timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or_else(GatewayError::not_connected)?;

        let request = tcp_frame(transaction_id, unit_id, pdu);
        trace!("TX {}", hex(&request));
        timeout(io_timeout, stream.write_all(&request))
            .await
            .map_err(|_| GatewayError::timeout("TCP send"))??;

        for _ in 0..MAX_STALE_RESPONSES {
            let mut header = [0u8; MBAP_HEADER_LEN];
            timeout(io_timeout, stream.read_exact(&mut header))
                .await
                .map_err(|_| GatewayError::timeout("TCP response header"))??;
            let (received_id, length) = parse_mbap_header(&header)?;

            let mut body = vec![0u8; length];
            timeout(io_timeout, stream.read_exact(&mut body))
                .await
                .map_err(|_| GatewayError::timeout("TCP response body"))??;
            trace!("RX {} {}", hex(&header), hex(&body));

            if received_id != transaction_id {
                debug!(
                    "Skipping stale response: transaction {} (expected {})",
                    received_id, transaction_id
                );
                continue;
            }
            if body[0] != unit_id {
                return Err(GatewayError::protocol(format!(
                    "Unit id mismatch: sent {}, got {}",
                    unit_id, body[0]
                )));
            }
            return Ok(body[1..].to_vec());
        }

        Err(GatewayError::transport(
            "No matching response after skipping stale frames",
        ))
    }
}

/// Serial link bound to a shared bus
#[derive(Debug)]
pub struct SerialLink {
    key: BusKey,
    timeout: Duration,
    registry: Arc<BusRegistry>,
    bus: Option<Arc<SharedBus>>,
}

impl SerialLink {
    pub fn new(key: BusKey, timeout: Duration, registry: Arc<BusRegistry>) -> Self {
        Self {
            key,
            timeout,
            registry,
            bus: None,
        }
    }

    pub fn key(&self) -> &BusKey {
        &self.key
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    /// Take a reference on the shared bus; the port opens on first use
    pub fn connect(&mut self) -> Result<()> {
        if self.bus.is_none() {
            self.bus = Some(self.registry.acquire(&self.key));
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.bus.take().is_some() {
            self.registry.release(&self.key);
        }
    }

    pub async fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        let bus = self.bus.as_ref().ok_or_else(GatewayError::not_connected)?;
        bus.transact(unit_id, pdu, self.timeout).await
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Either transport, as chosen by the device protocol
#[derive(Debug)]
pub enum ModbusLink {
    Tcp(TcpLink),
    Serial(SerialLink),
}

impl ModbusLink {
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(link) => link.is_connected(),
            Self::Serial(link) => link.is_connected(),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Tcp(link) => link.connect().await,
            Self::Serial(link) => link.connect(),
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Self::Tcp(link) => link.disconnect(),
            Self::Serial(link) => link.disconnect(),
        }
    }

    pub async fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Tcp(link) => link.transact(unit_id, pdu).await,
            Self::Serial(link) => link.transact(unit_id, pdu).await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(link) => link.address().to_string(),
            Self::Serial(link) => link.key().to_string(),
        }
    }
}
