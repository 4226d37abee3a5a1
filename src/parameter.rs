//! # Device Parameters
//!
//! A [`Parameter`] maps one named value to one or more remote addresses, an
//! access kind and a data encoding. Parameters are validated when built and
//! immutable afterwards.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::bytes::{parse_type_tag, WordOrder};
use crate::constants::{self, MAX_BIT_ARRAY_WIDTH};
use crate::error::{BusError, BusResult};
use crate::value::{DataType, Value};

/// Protocol-level read/write operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AccessKind {
    ReadCoil,
    ReadDiscreteInput,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleHoldingRegister,
    WriteMultipleCoils,
}

impl AccessKind {
    /// Read kinds, in the order a read plan visits them.
    pub const READ_KINDS: [AccessKind; 4] = [
        AccessKind::ReadCoil,
        AccessKind::ReadDiscreteInput,
        AccessKind::ReadHoldingRegisters,
        AccessKind::ReadInputRegisters,
    ];

    /// Modbus function code.
    #[inline]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoil => constants::FC_READ_COILS,
            Self::ReadDiscreteInput => constants::FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => constants::FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => constants::FC_READ_INPUT_REGISTERS,
            Self::WriteSingleHoldingRegister => constants::FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => constants::FC_WRITE_MULTIPLE_COILS,
        }
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::WriteSingleHoldingRegister | Self::WriteMultipleCoils
        )
    }

    /// True when each address carries one bit instead of one word.
    #[inline]
    pub fn is_bit_access(&self) -> bool {
        matches!(
            self,
            Self::ReadCoil | Self::ReadDiscreteInput | Self::WriteMultipleCoils
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadCoil => "ReadCoil",
            Self::ReadDiscreteInput => "ReadDiscreteInput",
            Self::ReadHoldingRegisters => "ReadHoldingRegisters",
            Self::ReadInputRegisters => "ReadInputRegisters",
            Self::WriteSingleHoldingRegister => "WriteSingleHoldingRegister",
            Self::WriteMultipleCoils => "WriteMultipleCoils",
        }
    }
}

impl FromStr for AccessKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "readcoil" | "readcoils" | "fc01" | "1" => Ok(Self::ReadCoil),
            "readdiscreteinput" | "readdiscreteinputs" | "fc02" | "2" => {
                Ok(Self::ReadDiscreteInput)
            }
            "readholdingregisters" | "readholdingregister" | "fc03" | "3" => {
                Ok(Self::ReadHoldingRegisters)
            }
            "readinputregisters" | "readinputregister" | "fc04" | "4" => {
                Ok(Self::ReadInputRegisters)
            }
            "writesingleholdingregister" | "writesingleregister" | "fc06" | "6" => {
                Ok(Self::WriteSingleHoldingRegister)
            }
            "writemultiplecoils" | "fc15" | "15" => Ok(Self::WriteMultipleCoils),
            _ => Err(BusError::config(format!("Unknown access kind: {}", s))),
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive `[min, max]` bound on a parameter's numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Fails with `BadRegisterValue` when `value` is numeric and outside the
    /// range. Strings are not range-checked.
    pub fn check(&self, name: &str, value: &Value) -> BusResult<()> {
        match value.as_f64() {
            Some(v) if !self.contains(v) => Err(BusError::bad_value(format!(
                "{}: {} outside [{}, {}]",
                name, value, self.min, self.max
            ))),
            _ => Ok(()),
        }
    }
}

/// Immutable descriptor of one device value.
///
/// # Example
///
/// ```rust
/// use voltage_regbus::{AccessKind, DataType, Parameter};
///
/// let p = Parameter::scalar("supply_temp", AccessKind::ReadInputRegisters, DataType::Float, 10)
///     .unwrap()
///     .with_unit("°C")
///     .with_range(-40.0, 120.0);
/// assert_eq!(p.addresses(), &[10, 11]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    unit: String,
    data_type: DataType,
    word_order: WordOrder,
    addresses: Vec<u16>,
    access: AccessKind,
    valid_range: Option<ValidRange>,
}

impl Parameter {
    /// Build a parameter from an explicit address list.
    ///
    /// Addresses must be strictly consecutive and match the data type's
    /// width: one per bit for coil kinds (up to 32), one word for 16-bit
    /// types and `bool`, two for 32-bit types, any count for strings.
    pub fn new(
        name: impl Into<String>,
        access: AccessKind,
        data_type: DataType,
        addresses: Vec<u16>,
    ) -> BusResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BusError::config("parameter name must not be empty"));
        }
        if addresses.is_empty() {
            return Err(BusError::bad_data_type(format!(
                "{}: at least one address is required",
                name
            )));
        }
        if addresses.len() > usize::from(u16::MAX) {
            return Err(BusError::bad_data_type(format!(
                "{}: {} addresses exceed the {} a parameter may span",
                name,
                addresses.len(),
                u16::MAX
            )));
        }
        let consecutive = addresses
            .windows(2)
            .all(|pair| pair[0].checked_add(1) == Some(pair[1]));
        if !consecutive {
            return Err(BusError::bad_data_type(format!(
                "{}: addresses {:?} are not consecutive",
                name, addresses
            )));
        }

        let count = addresses.len();
        if access.is_bit_access() {
            if data_type != DataType::Bool {
                return Err(BusError::bad_data_type(format!(
                    "{}: {} carries bits, declare it as bool (got {})",
                    name, access, data_type
                )));
            }
            if count > MAX_BIT_ARRAY_WIDTH {
                return Err(BusError::bad_data_type(format!(
                    "{}: {} bits exceed the {}-bit array limit",
                    name, count, MAX_BIT_ARRAY_WIDTH
                )));
            }
        } else if let Some(width) = data_type.word_count() {
            if count != width {
                return Err(BusError::bad_data_type(format!(
                    "{}: {} needs {} register(s), got {}",
                    name, data_type, width, count
                )));
            }
        }

        Ok(Self {
            name,
            unit: String::new(),
            data_type,
            word_order: WordOrder::BigEndian,
            addresses,
            access,
            valid_range: None,
        })
    }

    /// Build a fixed-width parameter starting at `address`.
    pub fn scalar(
        name: impl Into<String>,
        access: AccessKind,
        data_type: DataType,
        address: u16,
    ) -> BusResult<Self> {
        let width = data_type.word_count().unwrap_or(1);
        Self::new(name, access, data_type, consecutive_addresses(address, width)?)
    }

    /// Build a parameter from a type tag such as `int32_LE`.
    pub fn from_tag(
        name: impl Into<String>,
        access: AccessKind,
        tag: &str,
        address: u16,
    ) -> BusResult<Self> {
        let (data_type, order) = parse_type_tag(tag)?;
        Ok(Self::scalar(name, access, data_type, address)?.with_word_order(order))
    }

    /// Build a coil/discrete-input array of `count` bits.
    pub fn bit_array(
        name: impl Into<String>,
        access: AccessKind,
        start: u16,
        count: usize,
    ) -> BusResult<Self> {
        Self::new(name, access, DataType::Bool, consecutive_addresses(start, count)?)
    }

    /// Build an ASCII string parameter spanning `words` registers.
    pub fn string(
        name: impl Into<String>,
        access: AccessKind,
        start: u16,
        words: usize,
    ) -> BusResult<Self> {
        Self::new(name, access, DataType::String, consecutive_addresses(start, words)?)
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_word_order(mut self, order: WordOrder) -> Self {
        self.word_order = order;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.valid_range = Some(ValidRange::new(min, max));
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    #[inline]
    pub fn addresses(&self) -> &[u16] {
        &self.addresses
    }

    #[inline]
    pub fn access(&self) -> AccessKind {
        self.access
    }

    #[inline]
    pub fn valid_range(&self) -> Option<ValidRange> {
        self.valid_range
    }

    /// First address.
    #[inline]
    pub fn start(&self) -> u16 {
        self.addresses[0]
    }

    /// Number of addresses (words or bits) covered.
    #[inline]
    pub fn len(&self) -> u16 {
        self.addresses.len() as u16
    }

    /// Always false; a parameter covers at least one address.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Exclusive end address, widened so `65535 + 1` does not overflow.
    #[inline]
    pub fn end(&self) -> u32 {
        u32::from(self.start()) + u32::from(self.len())
    }

    /// True when a coil/discrete array spans more than one address.
    #[inline]
    pub fn is_bit_array(&self) -> bool {
        self.access.is_bit_access()
    }
}

fn consecutive_addresses(start: u16, count: usize) -> BusResult<Vec<u16>> {
    if count == 0 || count > usize::from(u16::MAX) {
        return Err(BusError::bad_data_type(format!(
            "{} address(es) from {} do not fit one parameter",
            count, start
        )));
    }
    let end = u32::from(start) + count as u32;
    if end > u32::from(u16::MAX) + 1 {
        return Err(BusError::bad_data_type(format!(
            "{} address(es) from {} do not fit the address space",
            count, start
        )));
    }
    Ok((u32::from(start)..end).map(|a| a as u16).collect())
}
