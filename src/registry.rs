//! `(vendor, model)` → device constructor map.

use std::collections::HashMap;
use std::fmt;

use crate::device::Device;
use crate::device_limits::DeviceLimits;
use crate::error::{BusError, BusResult};
use crate::parameter::{AccessKind, Parameter};
use crate::value::DataType;

/// Builds a device for a unit id.
pub type DeviceConstructor = fn(u8) -> BusResult<Device>;

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    constructors: HashMap<(String, String), DeviceConstructor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in catalogue.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("generic", "relay16", relay16);
        registry.register("generic", "energy_meter", energy_meter);
        registry
    }

    /// Add or replace a constructor.
    pub fn register(&mut self, vendor: &str, model: &str, constructor: DeviceConstructor) {
        self.constructors
            .insert((key(vendor), key(model)), constructor);
    }

    /// Instantiate `vendor`/`model` at `unit_id`. Matching ignores case.
    pub fn create(&self, vendor: &str, model: &str, unit_id: u8) -> BusResult<Device> {
        let constructor = self
            .constructors
            .get(&(key(vendor), key(model)))
            .ok_or_else(|| BusError::UnsupportedDevice {
                vendor: vendor.to_string(),
                model: model.to_string(),
            })?;
        constructor(unit_id)
    }

    pub fn supports(&self, vendor: &str, model: &str) -> bool {
        self.constructors.contains_key(&(key(vendor), key(model)))
    }

    /// Registered pairs, sorted.
    pub fn models(&self) -> Vec<(String, String)> {
        let mut models: Vec<_> = self.constructors.keys().cloned().collect();
        models.sort();
        models
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("models", &self.models())
            .finish()
    }
}

fn key(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// 16-channel relay board: coil feedback per channel, one 16-bit command word.
fn relay16(unit_id: u8) -> BusResult<Device> {
    let mut device = Device::new("generic", "relay16", unit_id);
    for channel in 0..16u16 {
        device.add_parameter(Parameter::bit_array(
            format!("k{}", channel + 1),
            AccessKind::ReadCoil,
            channel,
            1,
        )?)?;
    }
    device.add_parameter(Parameter::bit_array("outputs", AccessKind::WriteMultipleCoils, 0, 16)?)?;
    Ok(device)
}

/// Single-phase energy meter.
fn energy_meter(unit_id: u8) -> BusResult<Device> {
    Device::new("generic", "energy_meter", unit_id)
        .with_limits(DeviceLimits::conservative())
        .with_parameter(
            Parameter::scalar("voltage", AccessKind::ReadInputRegisters, DataType::Float, 0)?
                .with_unit("V")
                .with_range(0.0, 300.0),
        )?
        .with_parameter(
            Parameter::scalar("current", AccessKind::ReadInputRegisters, DataType::Float, 6)?
                .with_unit("A")
                .with_range(0.0, 100.0),
        )?
        .with_parameter(
            Parameter::scalar("active_power", AccessKind::ReadInputRegisters, DataType::Float, 12)?
                .with_unit("W"),
        )?
        .with_parameter(
            Parameter::scalar("frequency", AccessKind::ReadInputRegisters, DataType::Float, 70)?
                .with_unit("Hz")
                .with_range(45.0, 65.0),
        )?
        .with_parameter(
            Parameter::from_tag("energy_total", AccessKind::ReadHoldingRegisters, "uint32_LE", 342)?
                .with_unit("Wh"),
        )?
        .with_parameter(Parameter::string("serial", AccessKind::ReadHoldingRegisters, 400, 4)?)?
        .with_parameter(
            Parameter::scalar("ct_ratio", AccessKind::WriteSingleHoldingRegister, DataType::UInt16, 500)?
                .with_range(1.0, 5000.0),
        )
}
