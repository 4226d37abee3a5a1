//! # Word Order Handling
//!
//! Packing helpers for multi-word values and bit arrays.
//!
//! ## Terminology
//!
//! - **Word order**: order of 16-bit words when combining them into a 32-bit
//!   value. Bytes inside a word are always big-endian on the wire.
//! - **`_LE` tags**: a data type tag such as `int32_LE` or `float_le` selects
//!   little-endian word order. It swaps the two words, never the bytes.
//!
//! For the 32-bit value `0x12345678`:
//! - `BigEndian`: \[0x1234, 0x5678\]
//! - `LittleEndian`: \[0x5678, 0x1234\]

use std::fmt;
use std::str::FromStr;

use crate::error::{BusError, BusResult};
use crate::value::DataType;

/// Order of 16-bit words inside a 32-bit value.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::WordOrder;
///
/// let order: WordOrder = "LE".parse().unwrap();
/// assert_eq!(order, WordOrder::LittleEndian);
/// assert_eq!(order.join(0x5678, 0x1234), 0x12345678);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WordOrder {
    /// High word first (default, network order).
    #[default]
    BigEndian,
    /// Low word first.
    LittleEndian,
}

impl WordOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "BE",
            Self::LittleEndian => "LE",
        }
    }

    /// Combine two wire words into a 32-bit value.
    #[inline]
    pub fn join(&self, first: u16, second: u16) -> u32 {
        let (high, low) = match self {
            Self::BigEndian => (first, second),
            Self::LittleEndian => (second, first),
        };
        (u32::from(high) << 16) | u32::from(low)
    }

    /// Split a 32-bit value into two wire words.
    #[inline]
    pub fn split(&self, value: u32) -> [u16; 2] {
        let high = (value >> 16) as u16;
        let low = (value & 0xFFFF) as u16;
        match self {
            Self::BigEndian => [high, low],
            Self::LittleEndian => [low, high],
        }
    }
}

impl FromStr for WordOrder {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "" | "BE" | "BIGENDIAN" | "ABCD" => Ok(Self::BigEndian),
            "LE" | "LITTLEENDIAN" | "CDAB" => Ok(Self::LittleEndian),
            _ => Err(BusError::bad_data_type(format!("Unknown word order: {}", s))),
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a data type tag like `int32_LE` into its type and word order.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::{parse_type_tag, DataType, WordOrder};
///
/// assert_eq!(
///     parse_type_tag("float_le").unwrap(),
///     (DataType::Float, WordOrder::LittleEndian)
/// );
/// assert_eq!(
///     parse_type_tag("uint16").unwrap(),
///     (DataType::UInt16, WordOrder::BigEndian)
/// );
/// ```
pub fn parse_type_tag(tag: &str) -> BusResult<(DataType, WordOrder)> {
    let tag = tag.trim();
    let upper = tag.to_ascii_uppercase();
    for (suffix, order) in [("_LE", WordOrder::LittleEndian), ("_BE", WordOrder::BigEndian)] {
        if upper.ends_with(suffix) {
            let base = &tag[..tag.len() - suffix.len()];
            return Ok((base.parse()?, order));
        }
    }
    Ok((tag.parse()?, WordOrder::BigEndian))
}

// ============================================================================
// Bit arrays
// ============================================================================

/// Pack bits MSB-first in address order: the first bit becomes the most
/// significant bit of a `bits.len()`-wide integer.
///
/// ```rust
/// use voltage_regbus::pack_bits_msb;
///
/// assert_eq!(pack_bits_msb(&[true, false, true, true]), 0b1011);
/// ```
#[inline]
pub fn pack_bits_msb(bits: &[bool]) -> u32 {
    bits.iter()
        .fold(0u32, |acc, &bit| (acc << 1) | u32::from(bit))
}

/// Inverse of [`pack_bits_msb`] for a `width`-bit integer.
#[inline]
pub fn unpack_bits_msb(value: u32, width: usize) -> Vec<bool> {
    (0..width)
        .map(|i| (value >> (width - 1 - i)) & 1 == 1)
        .collect()
}

// ============================================================================
// Strings
// ============================================================================

/// Decode ASCII text packed two bytes per word, high byte first.
/// Trailing NUL bytes are padding and are dropped.
pub fn words_to_string(words: &[u16]) -> BusResult<String> {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if !bytes.is_ascii() {
        return Err(BusError::bad_data_type("string registers contain non-ASCII bytes"));
    }
    String::from_utf8(bytes).map_err(|e| BusError::bad_data_type(e.to_string()))
}

/// Pack ASCII text two bytes per word, padding an odd length with NUL.
pub fn string_to_words(text: &str) -> BusResult<Vec<u16>> {
    if !text.is_ascii() {
        return Err(BusError::bad_data_type(format!(
            "string '{}' is not ASCII",
            text
        )));
    }
    Ok(text
        .as_bytes()
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_split() {
        assert_eq!(WordOrder::BigEndian.split(0x12345678), [0x1234, 0x5678]);
        assert_eq!(WordOrder::LittleEndian.split(0x12345678), [0x5678, 0x1234]);
    }

    #[test]
    fn test_word_order_join() {
        assert_eq!(WordOrder::BigEndian.join(0x1234, 0x5678), 0x12345678);
        assert_eq!(WordOrder::LittleEndian.join(0x5678, 0x1234), 0x12345678);
    }

    #[test]
    fn test_word_order_from_str() {
        assert_eq!("be".parse::<WordOrder>().unwrap(), WordOrder::BigEndian);
        assert_eq!(
            "little_endian".parse::<WordOrder>().unwrap(),
            WordOrder::LittleEndian
        );
        assert_eq!("CD-AB".parse::<WordOrder>().unwrap(), WordOrder::LittleEndian);
        assert!("BADC".parse::<WordOrder>().is_err());
    }

    #[test]
    fn test_parse_type_tag() {
        assert_eq!(
            parse_type_tag("int32_LE").unwrap(),
            (DataType::Int32, WordOrder::LittleEndian)
        );
        assert_eq!(
            parse_type_tag("uint32_be").unwrap(),
            (DataType::UInt32, WordOrder::BigEndian)
        );
        assert_eq!(
            parse_type_tag(" float ").unwrap(),
            (DataType::Float, WordOrder::BigEndian)
        );
        assert!(parse_type_tag("int64_LE").is_err());
    }

    #[test]
    fn test_bits_msb_first() {
        assert_eq!(pack_bits_msb(&[true]), 1);
        assert_eq!(pack_bits_msb(&[true, false, false]), 0b100);
        assert_eq!(unpack_bits_msb(0b100, 3), vec![true, false, false]);
        assert_eq!(pack_bits_msb(&[]), 0);
    }

    #[test]
    fn test_string_packing() {
        let words = string_to_words("AHU1").unwrap();
        assert_eq!(words, vec![0x4148, 0x5531]);
        assert_eq!(words_to_string(&words).unwrap(), "AHU1");

        let words = string_to_words("abc").unwrap();
        assert_eq!(words, vec![0x6162, 0x6300]);
        assert_eq!(words_to_string(&[0x6162, 0x6300, 0x0000]).unwrap(), "abc");
    }

    #[test]
    fn test_string_rejects_non_ascii() {
        assert!(string_to_words("Zürich").is_err());
        assert!(words_to_string(&[0xC3BC]).is_err());
    }
}
