//! # Register Value Types
//!
//! Typed values carried by registers and device parameters, plus the data type
//! tags used by the schema and the codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Data type tag for registers and parameters.
///
/// # Register Mapping
///
/// | Type | Words | Aliases |
/// |------|-------|---------|
/// | bool | 1 (or 1 bit) | boolean, coil |
/// | int16 | 1 | i16, short |
/// | uint16 | 1 | u16, word |
/// | int32 | 2 | i32, long |
/// | uint32 | 2 | u32, dword |
/// | float | 2 | float32, f32, real |
/// | string | N | str, text |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
    String,
}

impl DataType {
    /// Number of 16-bit words a value of this type occupies.
    ///
    /// Returns `None` for strings, whose width is set by the parameter.
    #[inline]
    pub fn word_count(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Int16 | DataType::UInt16 => Some(1),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(2),
            DataType::String => None,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float => "float",
            DataType::String => "string",
        }
    }

    /// Zero value used when a schema gives no default.
    pub fn zero(&self) -> Value {
        match self {
            DataType::Bool => Value::Bool(false),
            DataType::Int16 => Value::Int16(0),
            DataType::UInt16 => Value::UInt16(0),
            DataType::Int32 => Value::Int32(0),
            DataType::UInt32 => Value::UInt32(0),
            DataType::Float => Value::Float(0.0),
            DataType::String => Value::String(String::new()),
        }
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String)
    }
}

impl FromStr for DataType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bool" | "boolean" | "coil" => Ok(DataType::Bool),
            "int16" | "i16" | "short" => Ok(DataType::Int16),
            "uint16" | "u16" | "word" => Ok(DataType::UInt16),
            "int32" | "i32" | "long" => Ok(DataType::Int32),
            "uint32" | "u32" | "dword" => Ok(DataType::UInt32),
            "float" | "float32" | "f32" | "real" => Ok(DataType::Float),
            "string" | "str" | "text" => Ok(DataType::String),
            other => Err(BusError::bad_data_type(format!(
                "Unsupported data type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed register value.
///
/// Equality treats two NaN floats as equal so that repeatedly writing NaN to a
/// register is a no-op like any other unchanged write.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::{DataType, Value};
///
/// let v = Value::Int32(42).coerce(DataType::UInt16).unwrap();
/// assert_eq!(v, Value::UInt16(42));
/// assert!(Value::Float(2.5).coerce(DataType::Int16).is_err());
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float(f32),
    String(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::UInt16(a), Value::UInt16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::UInt32(a), Value::UInt32(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int16(_) => DataType::Int16,
            Value::UInt16(_) => DataType::UInt16,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
        }
    }

    /// Numeric view of the value, `None` for strings.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int16(v) => Some(f64::from(*v)),
            Value::UInt16(v) => Some(f64::from(*v)),
            Value::Int32(v) => Some(f64::from(*v)),
            Value::UInt32(v) => Some(f64::from(*v)),
            Value::Float(v) => Some(f64::from(*v)),
            Value::String(_) => None,
        }
    }

    /// Truthiness for numeric values: non-zero is `true`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(_) => None,
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to `target` without losing information.
    ///
    /// Integers convert when they fit, floats convert to integers only when
    /// whole and in range, booleans map to and from 0/1. Strings never convert
    /// to or from numbers. Fails with `BadRegisterDataType` otherwise.
    pub fn coerce(self, target: DataType) -> BusResult<Value> {
        if self.data_type() == target {
            return Ok(self);
        }
        if target == DataType::String || matches!(self, Value::String(_)) {
            return Err(BusError::bad_data_type(format!(
                "cannot convert {} to {}",
                self.data_type(),
                target
            )));
        }

        let source = self.data_type();
        let number = self.as_f64().unwrap_or_default();
        let fits = |min: f64, max: f64| number.fract() == 0.0 && number >= min && number <= max;
        let converted = match target {
            DataType::Bool => fits(0.0, 1.0).then(|| Value::Bool(number != 0.0)),
            DataType::Int16 => {
                fits(f64::from(i16::MIN), f64::from(i16::MAX)).then(|| Value::Int16(number as i16))
            }
            DataType::UInt16 => fits(0.0, f64::from(u16::MAX)).then(|| Value::UInt16(number as u16)),
            DataType::Int32 => {
                fits(f64::from(i32::MIN), f64::from(i32::MAX)).then(|| Value::Int32(number as i32))
            }
            DataType::UInt32 => fits(0.0, f64::from(u32::MAX)).then(|| Value::UInt32(number as u32)),
            DataType::Float => {
                let f = number as f32;
                (number.is_nan() || f64::from(f) == number).then_some(Value::Float(f))
            }
            DataType::String => None,
        };

        converted.ok_or_else(|| {
            BusError::bad_data_type(format!(
                "{} value {} cannot be represented as {}",
                source, number, target
            ))
        })
    }

    /// Parse a textual value (schema defaults) as `data_type`.
    pub fn parse(data_type: DataType, text: &str) -> BusResult<Value> {
        let text = text.trim();
        let invalid = || BusError::bad_data_type(format!("'{}' is not a valid {}", text, data_type));
        match data_type {
            DataType::Bool => match text.to_lowercase().as_str() {
                "" | "0" | "false" | "off" | "no" => Ok(Value::Bool(false)),
                "1" | "true" | "on" | "yes" => Ok(Value::Bool(true)),
                _ => Err(invalid()),
            },
            DataType::String => Ok(Value::String(text.to_string())),
            DataType::Float if text.is_empty() => Ok(Value::Float(0.0)),
            DataType::Float => text.parse::<f32>().map(Value::Float).map_err(|_| invalid()),
            _ if text.is_empty() => Ok(data_type.zero()),
            _ => {
                if let Ok(i) = text.parse::<i64>() {
                    return integer_as(i, data_type).ok_or_else(invalid);
                }
                let f = text.parse::<f64>().map_err(|_| invalid())?;
                if !f.is_finite() || f.fract() != 0.0 {
                    return Err(invalid());
                }
                integer_as(f as i64, data_type).ok_or_else(invalid)
            }
        }
    }

    /// Convert a JSON value into `data_type`.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> BusResult<Value> {
        match json {
            serde_json::Value::Bool(b) => Value::Bool(*b).coerce(data_type),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    let converted = match data_type {
                        DataType::Float => Some(Value::Float(i as f32)),
                        DataType::Bool => matches!(i, 0 | 1).then_some(Value::Bool(i == 1)),
                        _ => integer_as(i, data_type),
                    };
                    return converted.ok_or_else(|| {
                        BusError::bad_data_type(format!("{} cannot be represented as {}", i, data_type))
                    });
                }
                let f = n.as_f64().unwrap_or(f64::NAN);
                match data_type {
                    DataType::Float => Ok(Value::Float(f as f32)),
                    DataType::String => Err(BusError::bad_data_type(format!(
                        "cannot convert number {} to string",
                        f
                    ))),
                    DataType::Bool if f == 0.0 || f == 1.0 => Ok(Value::Bool(f == 1.0)),
                    _ if f.fract() == 0.0 && f.is_finite() => integer_as(f as i64, data_type)
                        .ok_or_else(|| {
                            BusError::bad_data_type(format!(
                                "{} cannot be represented as {}",
                                f, data_type
                            ))
                        }),
                    _ => Err(BusError::bad_data_type(format!(
                        "{} cannot be represented as {}",
                        f, data_type
                    ))),
                }
            }
            serde_json::Value::String(s) if data_type == DataType::String => {
                Ok(Value::String(s.clone()))
            }
            serde_json::Value::String(s) => Value::parse(data_type, s),
            other => Err(BusError::bad_data_type(format!(
                "JSON {} cannot be represented as {}",
                other, data_type
            ))),
        }
    }

    /// JSON representation used by persistence and the aggregator.
    ///
    /// Non-finite floats become the strings `NaN`, `inf` and `-inf`, which
    /// [`Value::from_json`] parses back.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int16(v) => (*v).into(),
            Value::UInt16(v) => (*v).into(),
            Value::Int32(v) => (*v).into(),
            Value::UInt32(v) => (*v).into(),
            Value::Float(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(v.to_string())),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Integer as one of the integer data types, if it fits.
fn integer_as(i: i64, data_type: DataType) -> Option<Value> {
    match data_type {
        DataType::Int16 => i16::try_from(i).ok().map(Value::Int16),
        DataType::UInt16 => u16::try_from(i).ok().map(Value::UInt16),
        DataType::Int32 => i32::try_from(i).ok().map(Value::Int32),
        DataType::UInt32 => u32::try_from(i).ok().map(Value::UInt32),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// From implementations for ergonomic construction
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
