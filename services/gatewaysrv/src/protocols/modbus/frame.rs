//! PDU and ADU framing
//!
//! TCP frames carry an MBAP header (transaction id, protocol id 0, length,
//! unit id). RTU frames are `unit id + PDU + CRC-16` with the CRC low byte
//! first.

use bytes::{BufMut, BytesMut};

use super::constants::{
    EXCEPTION_FLAG, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH,
    MAX_PDU_SIZE, MAX_WRITE_REGISTERS, MBAP_HEADER_LEN,
};
use crate::error::{GatewayError, Result};

// ============================================================================
// PDU builders
// ============================================================================

/// FC01-FC04 request
pub fn read_request(function_code: u8, start: u16, count: u16) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function_code);
    pdu.put_u16(start);
    pdu.put_u16(count);
    pdu.to_vec()
}

/// FC05 request (ON = 0xFF00, OFF = 0x0000)
pub fn write_single_coil(address: u16, on: bool) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(FC_WRITE_SINGLE_COIL);
    pdu.put_u16(address);
    pdu.put_u16(if on { 0xFF00 } else { 0x0000 });
    pdu.to_vec()
}

/// FC06 request
pub fn write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(FC_WRITE_SINGLE_REGISTER);
    pdu.put_u16(address);
    pdu.put_u16(value);
    pdu.to_vec()
}

/// FC16 request
pub fn write_multiple_registers(address: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
        return Err(GatewayError::codec(format!(
            "FC16 supports 1-{} registers, got {}",
            MAX_WRITE_REGISTERS,
            values.len()
        )));
    }
    let mut pdu = BytesMut::with_capacity(6 + values.len() * 2);
    pdu.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
    pdu.put_u16(address);
    pdu.put_u16(values.len() as u16);
    pdu.put_u8((values.len() * 2) as u8);
    for value in values {
        pdu.put_u16(*value);
    }
    Ok(pdu.to_vec())
}

// ============================================================================
// Response parsing
// ============================================================================

/// Human readable meaning of a Modbus exception code, with a hint where useful
pub fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function (device does not support this function code)",
        0x02 => "Illegal data address (check the register map and address offset)",
        0x03 => "Illegal data value (value or quantity rejected by the device)",
        0x04 => "Server device failure",
        0x05 => "Acknowledge (request accepted, processing takes longer)",
        0x06 => "Server device busy (retry later)",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

fn check_exception(expected_fc: u8, pdu: &[u8]) -> Result<()> {
    let Some(&fc) = pdu.first() else {
        return Err(GatewayError::protocol("Empty response PDU"));
    };
    if fc == expected_fc | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(GatewayError::protocol(format!(
            "FC{:02} exception 0x{:02X}: {}",
            expected_fc,
            code,
            exception_message(code)
        )));
    }
    if fc != expected_fc {
        return Err(GatewayError::protocol(format!(
            "Function code mismatch: sent FC{:02}, got FC{:02}",
            expected_fc, fc
        )));
    }
    Ok(())
}

/// Parse an FC01-FC04 response into `count` words (one entry per bit for FC01/FC02)
pub fn parse_read_response(function_code: u8, count: u16, pdu: &[u8]) -> Result<Vec<u16>> {
    check_exception(function_code, pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| GatewayError::protocol("Response PDU too short"))? as usize;
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| GatewayError::protocol("Response shorter than its byte count"))?;

    if matches!(function_code, FC_READ_COILS | FC_READ_DISCRETE_INPUTS) {
        if byte_count < (count as usize).div_ceil(8) {
            return Err(GatewayError::protocol(format!(
                "Expected {} bits, got {} bytes",
                count, byte_count
            )));
        }
        return Ok((0..count as usize)
            .map(|i| u16::from((data[i / 8] >> (i % 8)) & 1))
            .collect());
    }

    if byte_count != count as usize * 2 {
        return Err(GatewayError::protocol(format!(
            "Expected {} registers, got {} bytes",
            count, byte_count
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validate a write echo (FC05/06/15/16)
pub fn check_write_response(function_code: u8, address: u16, pdu: &[u8]) -> Result<()> {
    check_exception(function_code, pdu)?;
    if !matches!(
        function_code,
        FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
    ) {
        return Err(GatewayError::unsupported(format!(
            "FC{:02} is not a write function",
            function_code
        )));
    }
    let echoed = pdu
        .get(1..3)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| GatewayError::protocol("Write response too short"))?;
    if echoed != address {
        return Err(GatewayError::protocol(format!(
            "Write response address mismatch: sent {}, got {}",
            address, echoed
        )));
    }
    Ok(())
}

// ============================================================================
// ADU framing
// ============================================================================

/// Modbus CRC-16 (polynomial 0xA001, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame.to_vec()
}

/// Split an MBAP header; returns (transaction id, remaining length)
pub fn parse_mbap_header(header: &[u8]) -> Result<(u16, usize)> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(GatewayError::protocol("MBAP header too short"));
    }
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if protocol_id != 0 {
        return Err(GatewayError::protocol(format!(
            "Invalid MBAP protocol id {}",
            protocol_id
        )));
    }
    if length < 2 || length > MAX_MBAP_LENGTH {
        return Err(GatewayError::protocol(format!(
            "Invalid MBAP length {}",
            length
        )));
    }
    Ok((transaction_id, length))
}

pub fn rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Validate an RTU frame and return (unit id, PDU)
pub fn parse_rtu_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < 4 || frame.len() > MAX_PDU_SIZE + 3 {
        return Err(GatewayError::protocol(format!(
            "Invalid RTU frame length {}",
            frame.len()
        )));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(GatewayError::protocol(format!(
            "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
            received, computed
        )));
    }
    Ok((body[0], &body[1..]))
}

/// Remaining RTU response bytes after unit id and function code are known
///
/// `third` is the byte following the function code (byte count for reads).
/// Returns `None` when the third byte is needed to decide.
pub fn rtu_remaining_len(function_code: u8, third: Option<u8>) -> Option<usize> {
    if function_code & EXCEPTION_FLAG != 0 {
        // exception code + CRC
        return Some(3);
    }
    match function_code {
        0x01..=0x04 => third.map(|byte_count| 1 + byte_count as usize + 2),
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => Some(4 + 2),
        _ => Some(2),
    }
}
