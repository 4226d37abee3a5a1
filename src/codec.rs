//! # Register Codec
//!
//! Pure conversion between raw 16-bit register words and typed [`Value`]s.
//! The codec has no state and knows nothing about valid ranges; callers apply
//! [`ValidRange`](crate::ValidRange) checks themselves.
//!
//! ## Supported Data Types
//!
//! | Type | Words | Notes |
//! |------|-------|-------|
//! | bool | 1 | non-zero word is `true` |
//! | int16 / uint16 | 1 | word reinterpreted with sign as needed |
//! | int32 / uint32 | 2 | word order from [`WordOrder`] |
//! | float | 2 | IEEE-754 single precision |
//! | string | N | two ASCII bytes per word |
//!
//! Coil and discrete-input arrays use [`decode_bits`] / [`encode_bits`]:
//! one bit per address, packed MSB-first.

use crate::bytes::{pack_bits_msb, string_to_words, unpack_bits_msb, words_to_string, WordOrder};
use crate::constants::MAX_BIT_ARRAY_WIDTH;
use crate::error::{BusError, BusResult};
use crate::value::{DataType, Value};

// ============================================================================
// Decoding Functions
// ============================================================================

/// Decode register words into a value of `data_type`.
///
/// The slice must carry exactly the number of words the type needs
/// (any non-zero count for strings); a mismatch fails with
/// `BadRegisterDataType`.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::{decode, DataType, Value, WordOrder};
///
/// let value = decode(&[0x1234, 0x5678], DataType::UInt32, WordOrder::BigEndian).unwrap();
/// assert_eq!(value, Value::UInt32(0x12345678));
///
/// let value = decode(&[0x5678, 0x1234], DataType::UInt32, WordOrder::LittleEndian).unwrap();
/// assert_eq!(value, Value::UInt32(0x12345678));
/// ```
pub fn decode(words: &[u16], data_type: DataType, order: WordOrder) -> BusResult<Value> {
    check_width(words.len(), data_type)?;

    let value = match data_type {
        DataType::Bool => Value::Bool(words[0] != 0),
        DataType::UInt16 => Value::UInt16(words[0]),
        DataType::Int16 => Value::Int16(words[0] as i16),
        DataType::UInt32 => Value::UInt32(order.join(words[0], words[1])),
        DataType::Int32 => Value::Int32(order.join(words[0], words[1]) as i32),
        DataType::Float => Value::Float(f32::from_bits(order.join(words[0], words[1]))),
        DataType::String => Value::String(words_to_string(words)?),
    };
    Ok(value)
}

/// Decode a coil/discrete-input array into an unsigned integer.
///
/// A single bit decodes to `bool`, up to 16 bits to `uint16`, up to 32 bits
/// to `uint32`. The first address is the most significant bit.
///
/// ```rust
/// use voltage_regbus::{decode_bits, Value};
///
/// assert_eq!(decode_bits(&[true]).unwrap(), Value::Bool(true));
/// assert_eq!(decode_bits(&[true, false, true]).unwrap(), Value::UInt16(0b101));
/// ```
pub fn decode_bits(bits: &[bool]) -> BusResult<Value> {
    let packed = pack_bits_msb(bits);
    match bits.len() {
        0 => Err(BusError::bad_data_type("empty bit array")),
        1 => Ok(Value::Bool(bits[0])),
        2..=16 => Ok(Value::UInt16(packed as u16)),
        n if n <= MAX_BIT_ARRAY_WIDTH => Ok(Value::UInt32(packed)),
        n => Err(BusError::bad_data_type(format!(
            "bit array of {} bits exceeds {} bits",
            n, MAX_BIT_ARRAY_WIDTH
        ))),
    }
}

// ============================================================================
// Encoding Functions
// ============================================================================

/// Encode `value` as register words of `data_type`, the exact inverse of
/// [`decode`].
///
/// The value is first converted losslessly to `data_type`. A value that does
/// not fit (a float beyond the int16 range, a fraction for an integer type,
/// non-ASCII text) fails with `BadRegisterDataType`. Strings encode to the
/// minimal number of words; callers pad to their declared width.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::{encode, DataType, Value, WordOrder};
///
/// let words = encode(&Value::UInt32(0x12345678), DataType::UInt32, WordOrder::LittleEndian).unwrap();
/// assert_eq!(words, vec![0x5678, 0x1234]);
/// assert!(encode(&Value::Float(1.0e6), DataType::Int16, WordOrder::BigEndian).is_err());
/// ```
pub fn encode(value: &Value, data_type: DataType, order: WordOrder) -> BusResult<Vec<u16>> {
    let words = match value.clone().coerce(data_type)? {
        Value::Bool(b) => vec![u16::from(b)],
        Value::UInt16(v) => vec![v],
        Value::Int16(v) => vec![v as u16],
        Value::UInt32(v) => order.split(v).to_vec(),
        Value::Int32(v) => order.split(v as u32).to_vec(),
        Value::Float(v) => order.split(v.to_bits()).to_vec(),
        Value::String(s) => string_to_words(&s)?,
    };
    Ok(words)
}

/// Encode `value` as a `width`-bit array, the inverse of [`decode_bits`].
pub fn encode_bits(value: &Value, width: usize) -> BusResult<Vec<bool>> {
    if width == 0 || width > MAX_BIT_ARRAY_WIDTH {
        return Err(BusError::bad_data_type(format!(
            "bit array width {} outside 1..={}",
            width, MAX_BIT_ARRAY_WIDTH
        )));
    }
    let packed = match value {
        Value::String(_) => {
            return Err(BusError::bad_data_type("cannot encode a string as bits"));
        }
        Value::Bool(b) => u64::from(*b),
        other => {
            let number = other.as_f64().unwrap_or_default();
            if number < 0.0 || number.fract() != 0.0 {
                return Err(BusError::bad_data_type(format!(
                    "{} cannot be represented as {} bits",
                    number, width
                )));
            }
            number as u64
        }
    };
    if packed >> width != 0 {
        return Err(BusError::bad_data_type(format!(
            "{} does not fit in {} bits",
            packed, width
        )));
    }
    Ok(unpack_bits_msb(packed as u32, width))
}

/// Number of 16-bit words a data type occupies (1 for strings' minimum).
#[inline]
pub fn registers_for_type(data_type: DataType) -> usize {
    data_type.word_count().unwrap_or(1)
}

fn check_width(count: usize, data_type: DataType) -> BusResult<()> {
    let ok = match data_type.word_count() {
        Some(expected) => count == expected,
        None => count > 0,
    };
    if ok {
        Ok(())
    } else {
        Err(BusError::bad_data_type(format!(
            "{} needs {} word(s), got {}",
            data_type,
            data_type
                .word_count()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "at least 1".to_string()),
            count
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================
