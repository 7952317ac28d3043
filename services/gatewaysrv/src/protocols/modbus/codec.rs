//! Register codec
//!
//! Converts between raw register words and typed values. Word order reverses
//! the register sequence, byte order swaps the two bytes inside each register;
//! both are applied independently. After reordering, bytes are read big-endian.

use super::types::{ByteOrder, ModbusSource, RegisterType, WordOrder};
use crate::error::{GatewayError, Result};
use crate::value::Value;

/// Flatten registers into a big-endian byte sequence honouring word and byte order
pub fn words_to_bytes(words: &[u16], word_order: WordOrder, byte_order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    let mut push = |w: u16| {
        let w = match byte_order {
            ByteOrder::BigEndian => w,
            ByteOrder::LittleEndian => w.swap_bytes(),
        };
        bytes.extend_from_slice(&w.to_be_bytes());
    };
    match word_order {
        WordOrder::HighFirst => words.iter().copied().for_each(&mut push),
        WordOrder::LowFirst => words.iter().rev().copied().for_each(&mut push),
    }
    bytes
}

/// Inverse of [`words_to_bytes`]
pub fn bytes_to_words(bytes: &[u8], word_order: WordOrder, byte_order: ByteOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let w = u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
            match byte_order {
                ByteOrder::BigEndian => w,
                ByteOrder::LittleEndian => w.swap_bytes(),
            }
        })
        .collect();
    if word_order == WordOrder::LowFirst {
        words.reverse();
    }
    words
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| GatewayError::codec(format!("Need {} bytes, have {}", N, bytes.len())))
}

/// Decode the registers of one data point into its raw (unscaled) value
///
/// For FC1/FC2 sources `words` holds one entry per bit (0 or 1).
pub fn decode_registers(words: &[u16], source: &ModbusSource) -> Result<Value> {
    let expected = source.quantity() as usize;
    if words.len() != expected {
        return Err(GatewayError::codec(format!(
            "Address {}: expected {} registers, got {}",
            source.address,
            expected,
            words.len()
        )));
    }

    if source.is_bit_source() {
        return Ok(Value::Bool(words[0] != 0));
    }

    if source.data_type == RegisterType::Bool {
        let word = match source.byte_order {
            ByteOrder::BigEndian => words[0],
            ByteOrder::LittleEndian => words[0].swap_bytes(),
        };
        return Ok(Value::Bool(match source.bit {
            Some(bit) => (word >> bit) & 1 == 1,
            None => word != 0,
        }));
    }

    let bytes = words_to_bytes(words, source.word_order, source.byte_order);
    let value = match source.data_type {
        RegisterType::Int8 => Value::Int(i64::from(bytes[1] as i8)),
        RegisterType::Uint8 => Value::Int(i64::from(bytes[1])),
        RegisterType::Int16 => Value::Int(i64::from(i16::from_be_bytes(array(&bytes)?))),
        RegisterType::Uint16 => Value::Int(i64::from(u16::from_be_bytes(array(&bytes)?))),
        RegisterType::Int32 => Value::Int(i64::from(i32::from_be_bytes(array(&bytes)?))),
        RegisterType::Uint32 => Value::Int(i64::from(u32::from_be_bytes(array(&bytes)?))),
        RegisterType::Int64 => Value::Int(i64::from_be_bytes(array(&bytes)?)),
        RegisterType::Uint64 => Value::from(u64::from_be_bytes(array(&bytes)?)),
        RegisterType::Float32 => Value::Float(f64::from(f32::from_be_bytes(array(&bytes)?))),
        RegisterType::Float64 => Value::Float(f64::from_be_bytes(array(&bytes)?)),
        RegisterType::String => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            let text = String::from_utf8_lossy(&bytes[..end]);
            Value::Text(text.trim().to_string())
        },
        RegisterType::Bool => Value::Bool(words[0] != 0),
    };
    Ok(value)
}

fn integer_of(value: &Value, source: &ModbusSource) -> Result<i128> {
    match value {
        Value::Int(i) => Ok(i128::from(*i)),
        Value::UInt(u) => Ok(i128::from(*u)),
        Value::Float(f) if f.is_finite() => Ok(f.round() as i128),
        other => other.as_i64().map(i128::from).ok_or_else(|| {
            GatewayError::codec(format!(
                "Address {}: cannot encode {} as {:?}",
                source.address, other, source.data_type
            ))
        }),
    }
}

fn checked(v: i128, min: i128, max: i128, source: &ModbusSource) -> Result<i128> {
    if v < min || v > max {
        return Err(GatewayError::codec(format!(
            "Address {}: {} out of range for {:?}",
            source.address, v, source.data_type
        )));
    }
    Ok(v)
}

/// Encode a raw (already unscaled) value into register words
///
/// For FC1 sources the single returned word is 0 or 1.
pub fn encode_value(value: &Value, source: &ModbusSource) -> Result<Vec<u16>> {
    let as_bool = || {
        value.as_bool().ok_or_else(|| {
            GatewayError::codec(format!(
                "Address {}: cannot encode {} as bool",
                source.address, value
            ))
        })
    };

    if source.is_bit_source() {
        return Ok(vec![u16::from(as_bool()?)]);
    }

    let bytes: Vec<u8> = match source.data_type {
        RegisterType::Bool => {
            if source.bit.is_some() {
                return Err(GatewayError::unsupported(format!(
                    "Address {}: writing a single register bit needs read-modify-write",
                    source.address
                )));
            }
            u16::from(as_bool()?).to_be_bytes().to_vec()
        },
        RegisterType::Int8 => {
            let v = checked(integer_of(value, source)?, -128, 127, source)?;
            vec![0, v as i8 as u8]
        },
        RegisterType::Uint8 => {
            let v = checked(integer_of(value, source)?, 0, 255, source)?;
            vec![0, v as u8]
        },
        RegisterType::Int16 => {
            let v = checked(integer_of(value, source)?, i16::MIN.into(), i16::MAX.into(), source)?;
            (v as i16).to_be_bytes().to_vec()
        },
        RegisterType::Uint16 => {
            let v = checked(integer_of(value, source)?, 0, u16::MAX.into(), source)?;
            (v as u16).to_be_bytes().to_vec()
        },
        RegisterType::Int32 => {
            let v = checked(integer_of(value, source)?, i32::MIN.into(), i32::MAX.into(), source)?;
            (v as i32).to_be_bytes().to_vec()
        },
        RegisterType::Uint32 => {
            let v = checked(integer_of(value, source)?, 0, u32::MAX.into(), source)?;
            (v as u32).to_be_bytes().to_vec()
        },
        RegisterType::Int64 => {
            let v = checked(integer_of(value, source)?, i64::MIN.into(), i64::MAX.into(), source)?;
            (v as i64).to_be_bytes().to_vec()
        },
        RegisterType::Uint64 => {
            let v = checked(integer_of(value, source)?, 0, u64::MAX.into(), source)?;
            (v as u64).to_be_bytes().to_vec()
        },
        RegisterType::Float32 | RegisterType::Float64 => {
            let f = value.as_f64().ok_or_else(|| {
                GatewayError::codec(format!(
                    "Address {}: cannot encode {} as float",
                    source.address, value
                ))
            })?;
            if source.data_type == RegisterType::Float32 {
                (f as f32).to_be_bytes().to_vec()
            } else {
                f.to_be_bytes().to_vec()
            }
        },
        RegisterType::String => {
            let capacity = source.quantity() as usize * 2;
            let text = match value {
                Value::Text(s) => s.clone(),
                other => other.to_string(),
            };
            if !text.is_ascii() || text.len() > capacity {
                return Err(GatewayError::codec(format!(
                    "Address {}: string '{}' does not fit {} ASCII bytes",
                    source.address, text, capacity
                )));
            }
            let mut bytes = text.into_bytes();
            bytes.resize(capacity, 0);
            bytes
        },
    };

    Ok(bytes_to_words(&bytes, source.word_order, source.byte_order))
}

fn is_scalable(source: &ModbusSource) -> bool {
    !source.is_bit_source()
        && !matches!(source.data_type, RegisterType::Bool | RegisterType::String)
}

/// Apply `multiplier` (static scale times scale factor) and offset to a raw value
pub fn apply_scale(raw: Value, source: &ModbusSource, multiplier: f64) -> Value {
    let offset = source.offset.unwrap_or(0.0);
    if !is_scalable(source) || (multiplier == 1.0 && offset == 0.0) {
        return raw;
    }
    match raw.as_f64() {
        Some(v) => Value::Float(v * multiplier + offset),
        None => raw,
    }
}

/// Inverse of [`apply_scale`], used before encoding a write
pub fn remove_scale(value: &Value, source: &ModbusSource, multiplier: f64) -> Result<Value> {
    let offset = source.offset.unwrap_or(0.0);
    if !is_scalable(source) || (multiplier == 1.0 && offset == 0.0) {
        return Ok(value.clone());
    }
    if multiplier == 0.0 || !multiplier.is_finite() {
        return Err(GatewayError::codec(format!(
            "Address {}: invalid scale multiplier {}",
            source.address, multiplier
        )));
    }
    let v = value.as_f64().ok_or_else(|| {
        GatewayError::codec(format!(
            "Address {}: cannot scale non-numeric value {}",
            source.address, value
        ))
    })?;
    Ok(Value::Float((v - offset) / multiplier))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn src(data_type: RegisterType, word_order: WordOrder, byte_order: ByteOrder) -> ModbusSource {
        ModbusSource {
            function_code: 3,
            address: 100,
            length: None,
            data_type,
            word_order,
            byte_order,
            scale: None,
            offset: None,
            scale_factor_ref: None,
            bit: None,
            unit_id: None,
            write_multiple: false,
        }
    }

    const ORDERS: [(WordOrder, ByteOrder); 4] = [
        (WordOrder::HighFirst, ByteOrder::BigEndian),
        (WordOrder::LowFirst, ByteOrder::BigEndian),
        (WordOrder::HighFirst, ByteOrder::LittleEndian),
        (WordOrder::LowFirst, ByteOrder::LittleEndian),
    ];

    // ---------- byte ordering tests ----------

    #[test]
    fn test_word_and_byte_order_layouts() {
        let words = [0x0102, 0x0304];
        assert_eq!(
            words_to_bytes(&words, WordOrder::HighFirst, ByteOrder::BigEndian),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            words_to_bytes(&words, WordOrder::LowFirst, ByteOrder::BigEndian),
            vec![3, 4, 1, 2]
        );
        assert_eq!(
            words_to_bytes(&words, WordOrder::HighFirst, ByteOrder::LittleEndian),
            vec![2, 1, 4, 3]
        );
        assert_eq!(
            words_to_bytes(&words, WordOrder::LowFirst, ByteOrder::LittleEndian),
            vec![4, 3, 2, 1]
        );
    }

    #[test]
    fn test_decode_uint32_word_orders() {
        let high = src(RegisterType::Uint32, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert_eq!(
            decode_registers(&[0x0001, 0x0002], &high).unwrap(),
            Value::Int(0x0001_0002)
        );
        let low = src(RegisterType::Uint32, WordOrder::LowFirst, ByteOrder::BigEndian);
        assert_eq!(
            decode_registers(&[0x0001, 0x0002], &low).unwrap(),
            Value::Int(0x0002_0001)
        );
    }

    #[test]
    fn test_decode_float32() {
        let s = src(RegisterType::Float32, WordOrder::HighFirst, ByteOrder::BigEndian);
        // 25.0f32 = 0x41C80000
        assert_eq!(
            decode_registers(&[0x41C8, 0x0000], &s).unwrap(),
            Value::Float(25.0)
        );
    }

    #[test]
    fn test_decode_signed() {
        let s = src(RegisterType::Int16, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert_eq!(decode_registers(&[0xFFFE], &s).unwrap(), Value::Int(-2));
        let s = src(RegisterType::Int8, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert_eq!(decode_registers(&[0x00FF], &s).unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_decode_ascii_trims_padding() {
        let mut s = src(RegisterType::String, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.length = Some(4);
        // "SMA " followed by NUL padding
        let words = [0x534D, 0x4120, 0x0000, 0x0000];
        assert_eq!(
            decode_registers(&words, &s).unwrap(),
            Value::Text("SMA".into())
        );
    }

    #[test]
    fn test_decode_register_bit() {
        let mut s = src(RegisterType::Bool, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.bit = Some(3);
        assert_eq!(decode_registers(&[0b1000], &s).unwrap(), Value::Bool(true));
        assert_eq!(decode_registers(&[0b0111], &s).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let s = src(RegisterType::Uint32, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert!(matches!(
            decode_registers(&[1], &s),
            Err(GatewayError::Codec(_))
        ));
    }

    // ---------- round trip tests ----------

    fn integer_cases() -> Vec<(RegisterType, Value)> {
        let bounds: [(RegisterType, i128, i128); 8] = [
            (RegisterType::Int8, i8::MIN.into(), i8::MAX.into()),
            (RegisterType::Uint8, 0, u8::MAX.into()),
            (RegisterType::Int16, i16::MIN.into(), i16::MAX.into()),
            (RegisterType::Uint16, 0, u16::MAX.into()),
            (RegisterType::Int32, i32::MIN.into(), i32::MAX.into()),
            (RegisterType::Uint32, 0, u32::MAX.into()),
            (RegisterType::Int64, i64::MIN.into(), i64::MAX.into()),
            (RegisterType::Uint64, 0, u64::MAX.into()),
        ];
        let mut cases = Vec::new();
        for (data_type, min, max) in bounds {
            let mut values = vec![0, 1, min, max, min + 1, max - 1];
            if min < 0 {
                values.push(-1);
            }
            for v in values {
                let value = match i64::try_from(v) {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::UInt(v as u64),
                };
                cases.push((data_type, value));
            }
        }
        cases
    }

    #[test]
    fn test_round_trip_integers_all_orders() {
        for (word_order, byte_order) in ORDERS {
            for (data_type, value) in integer_cases() {
                let s = src(data_type, word_order, byte_order);
                let words = encode_value(&value, &s).unwrap();
                assert_eq!(words.len(), s.quantity() as usize);
                assert_eq!(
                    decode_registers(&words, &s).unwrap(),
                    value,
                    "{:?} {:?} {:?}",
                    data_type,
                    word_order,
                    byte_order
                );
            }
        }
    }

    #[test]
    fn test_uint64_above_i64_range_is_exact() {
        let s = src(RegisterType::Uint64, WordOrder::HighFirst, ByteOrder::BigEndian);
        let value = decode_registers(&[0xFFFF; 4], &s).unwrap();
        assert_eq!(value, Value::UInt(u64::MAX));
        assert_eq!(encode_value(&value, &s).unwrap(), vec![0xFFFF; 4]);

        let words = [0x8000, 0x0000, 0x0000, 0x0001];
        let value = decode_registers(&words, &s).unwrap();
        assert_eq!(value, Value::UInt(0x8000_0000_0000_0001));
        assert_eq!(encode_value(&value, &s).unwrap(), words.to_vec());
    }

    #[test]
    fn test_raw_registers_survive_decode_encode() {
        let patterns: [[u16; 4]; 4] = [
            [0x0000; 4],
            [0xFFFF; 4],
            [0x8000, 0x0000, 0x0000, 0x0000],
            [0x7FFF, 0xFFFF, 0xFFFF, 0xFFFF],
        ];
        let types = [
            (RegisterType::Int16, 1),
            (RegisterType::Uint16, 1),
            (RegisterType::Int32, 2),
            (RegisterType::Uint32, 2),
            (RegisterType::Int64, 4),
            (RegisterType::Uint64, 4),
        ];
        for (word_order, byte_order) in ORDERS {
            for (data_type, count) in types {
                let s = src(data_type, word_order, byte_order);
                for pattern in &patterns {
                    let words = &pattern[..count];
                    let value = decode_registers(words, &s).unwrap();
                    assert_eq!(
                        encode_value(&value, &s).unwrap(),
                        words.to_vec(),
                        "{:?} {:?} {:?} {:?}",
                        data_type,
                        word_order,
                        byte_order,
                        words
                    );
                }
            }
        }
    }

    #[test]
    fn test_round_trip_floats_and_strings() {
        for (word_order, byte_order) in ORDERS {
            let s = src(RegisterType::Float32, word_order, byte_order);
            let words = encode_value(&Value::Float(-1.5), &s).unwrap();
            assert_eq!(decode_registers(&words, &s).unwrap(), Value::Float(-1.5));

            let s = src(RegisterType::Float64, word_order, byte_order);
            let words = encode_value(&Value::Float(1234.5678), &s).unwrap();
            assert_eq!(
                decode_registers(&words, &s).unwrap(),
                Value::Float(1234.5678)
            );

            let mut s = src(RegisterType::String, word_order, byte_order);
            s.length = Some(5);
            let words = encode_value(&Value::Text("INV-42".into()), &s).unwrap();
            assert_eq!(
                decode_registers(&words, &s).unwrap(),
                Value::Text("INV-42".into())
            );
        }
    }

    #[test]
    fn test_encode_out_of_range() {
        let s = src(RegisterType::Uint16, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert!(matches!(
            encode_value(&Value::Int(70000), &s),
            Err(GatewayError::Codec(_))
        ));
        assert!(encode_value(&Value::Int(-1), &s).is_err());
    }

    #[test]
    fn test_encode_string_too_long() {
        let mut s = src(RegisterType::String, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.length = Some(1);
        assert!(encode_value(&Value::Text("abc".into()), &s).is_err());
    }

    #[test]
    fn test_encode_coil() {
        let mut s = src(RegisterType::Bool, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.function_code = 1;
        assert_eq!(encode_value(&Value::Bool(true), &s).unwrap(), vec![1]);
        assert_eq!(encode_value(&Value::Int(0), &s).unwrap(), vec![0]);
    }

    #[test]
    fn test_encode_register_bit_unsupported() {
        let mut s = src(RegisterType::Bool, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.bit = Some(2);
        assert!(matches!(
            encode_value(&Value::Bool(true), &s),
            Err(GatewayError::UnsupportedOperation(_))
        ));
    }

    // ---------- scaling tests ----------

    #[test]
    fn test_scale_and_inverse() {
        let mut s = src(RegisterType::Int16, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.offset = Some(-40.0);
        let scaled = apply_scale(Value::Int(650), &s, 0.1);
        assert_eq!(scaled.as_f64().map(|v| (v * 1000.0).round() / 1000.0), Some(25.0));

        let raw = remove_scale(&Value::Float(25.0), &s, 0.1).unwrap();
        assert_eq!(raw.as_i64(), Some(650));
    }

    #[test]
    fn test_identity_scale_keeps_integers() {
        let s = src(RegisterType::Uint16, WordOrder::HighFirst, ByteOrder::BigEndian);
        assert_eq!(apply_scale(Value::Int(7), &s, 1.0), Value::Int(7));
    }

    #[test]
    fn test_strings_never_scaled() {
        let mut s = src(RegisterType::String, WordOrder::HighFirst, ByteOrder::BigEndian);
        s.length = Some(2);
        assert_eq!(
            apply_scale(Value::Text("ab".into()), &s, 10.0),
            Value::Text("ab".into())
        );
    }
}
