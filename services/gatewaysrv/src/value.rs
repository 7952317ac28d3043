//! Data point values
//!
//! `Value` is the protocol-neutral representation that flows between drivers,
//! the alias engine and the state store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Decimal places kept for floating point values without an explicit precision
pub const DEFAULT_FLOAT_PRECISION: u8 = 3;

/// A single data point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// Unsigned integers beyond `i64::MAX`
    UInt(u64),
    Float(f64),
    Text(String),
    Null,
}

/// Latest values keyed by data point id (ordered for deterministic iteration)
pub type ValueMap = BTreeMap<String, Value>;

/// Semantic kind of a data point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Number,
    Boolean,
    String,
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::UInt(v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::UInt(u) => write!(f, "{}", u),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Null => write!(f, "null"),
        }
    }
}

impl Value {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null => None,
        }
    }

    /// Try to convert to i64 (floats are rounded)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            Self::Float(f) if f.is_finite() => Some(f.round() as i64),
            Self::Float(_) => None,
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::UInt(u) => Some(*u != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            Self::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric values other than zero, and `true`
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Text(s) => !s.is_empty(),
            other => other.as_bool().unwrap_or(false),
        }
    }

    /// Normalize a value for publication.
    ///
    /// Numbers are rounded to `precision` decimals (default 3 for floats),
    /// integral floats collapse to `Int`, booleans are coerced from numbers and
    /// strings lose trailing NUL padding.
    pub fn normalized(&self, kind: ValueKind, precision: Option<u8>) -> Value {
        match kind {
            ValueKind::Number => match self {
                Self::Float(f) if !f.is_finite() => Self::Null,
                Self::Float(f) => {
                    let rounded = round_to(*f, precision.unwrap_or(DEFAULT_FLOAT_PRECISION));
                    if rounded.fract() == 0.0 && rounded.abs() < 9.0e15 {
                        Self::Int(rounded as i64)
                    } else {
                        Self::Float(rounded)
                    }
                },
                Self::Int(i) => Self::Int(*i),
                Self::UInt(u) => Value::from(*u),
                Self::Bool(b) => Self::Int(i64::from(*b)),
                Self::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|f| Self::Float(f).normalized(kind, precision))
                    .unwrap_or(Self::Null),
                Self::Null => Self::Null,
            },
            ValueKind::Boolean => self.as_bool().map(Self::Bool).unwrap_or(Self::Null),
            ValueKind::String => match self {
                Self::Text(s) => Self::Text(s.trim_end_matches('\0').to_string()),
                Self::Null => Self::Null,
                other => Self::Text(other.to_string()),
            },
        }
    }
}

fn round_to(value: f64, decimals: u8) -> f64 {
    let factor = 10f64.powi(i32::from(decimals.min(12)));
    (value * factor).round() / factor
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        let v = Value::from(42i64);
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));

        let v = Value::from(2.75f64);
        assert_eq!(v.as_f64(), Some(2.75));
        assert_eq!(v.as_i64(), Some(3));

        let v = Value::from(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_i64(), Some(1));

        assert_eq!(Value::from(5u64), Value::Int(5));
        assert_eq!(Value::from(u64::MAX), Value::UInt(u64::MAX));
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);

        assert_eq!(Value::from("on").as_bool(), Some(true));
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_normalize_number_rounding() {
        let v = Value::Float(229.800_003_051_757_8);
        assert_eq!(v.normalized(ValueKind::Number, None), Value::Float(229.8));
        assert_eq!(
            Value::Float(1.23456).normalized(ValueKind::Number, Some(1)),
            Value::Float(1.2)
        );
        assert_eq!(
            Value::Float(1500.0).normalized(ValueKind::Number, None),
            Value::Int(1500)
        );
        assert_eq!(
            Value::Float(f64::NAN).normalized(ValueKind::Number, None),
            Value::Null
        );
    }

    #[test]
    fn test_normalize_boolean_and_string() {
        assert_eq!(
            Value::Int(2).normalized(ValueKind::Boolean, None),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Text("SN123\0\0".into()).normalized(ValueKind::String, None),
            Value::Text("SN123".into())
        );
        assert_eq!(
            Value::Int(7).normalized(ValueKind::String, None),
            Value::Text("7".into())
        );
    }

    #[test]
    fn test_untagged_deserialize() {
        let v: Value = serde_yaml::from_str("1").unwrap();
        assert_eq!(v, Value::Int(1));
        let v: Value = serde_yaml::from_str("1.5").unwrap();
        assert_eq!(v, Value::Float(1.5));
        let v: Value = serde_yaml::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
        let v: Value = serde_yaml::from_str("18446744073709551615").unwrap();
        assert_eq!(v, Value::UInt(u64::MAX));
        let v: Value = serde_yaml::from_str("\"auto\"").unwrap();
        assert_eq!(v, Value::Text("auto".into()));
    }
}
