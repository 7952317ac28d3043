//! Modbus protocol limits
//!
//! Derived from the 253-byte PDU limit of the Modbus application protocol.

/// Modbus MBAP header length for TCP (transaction id, protocol id, length)
/// The unit id byte that follows is counted by the length field.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size: RS485 ADU (256) - slave address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// FC03/FC04 response: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16 request: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02 response: 1 + 1 + ceil(N/8) <= 253, rounded down to 2000
pub const MAX_READ_COILS: u16 = 2000;

/// Default read span for register function codes
pub const DEFAULT_MAX_READ_REGISTERS: u16 = 120;

/// Default read span for bit function codes
pub const DEFAULT_MAX_READ_BITS: u16 = 2000;

/// Exception responses set the high bit of the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Register value SunSpec uses for "not implemented" scale factors
pub const SCALE_FACTOR_NOT_IMPLEMENTED: i16 = -32768;

/// "SunS" marker at the start of a SunSpec register map
pub const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6E53];

/// Candidate base addresses probed for the SunSpec marker
pub const SUNSPEC_BASE_ADDRESSES: [u16; 3] = [40000, 50000, 0];

/// Whether a read function code addresses single bits
pub fn is_bit_function(function_code: u8) -> bool {
    matches!(function_code, FC_READ_COILS | FC_READ_DISCRETE_INPUTS)
}

/// Whether the function code is one of the four supported reads
pub fn is_read_function(function_code: u8) -> bool {
    matches!(
        function_code,
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS
    )
}
