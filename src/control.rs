//! # Control Loop
//!
//! One task, fixed period, deterministic order. Each tick:
//!
//! 1. poll every device (in the order added) and `set` each available reading
//!    into its bound register; unavailable readings leave the register as is
//! 2. run every plugin (in the order added)
//! 3. for every command binding whose register value differs from the value
//!    last sent, call [`Device::write`]
//!
//! Failures are reported to the [`ErrorAggregator`] and never stop the tick.
//! A rejected command value (bad type, out of range) is not retried; a command
//! that failed for lack of a connection is retried on the next tick.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::aggregator::ErrorAggregator;
use crate::device::Device;
use crate::error::{BusError, BusResult};
use crate::register::RegisterBus;
use crate::transport::Transport;
use crate::value::Value;

/// Control logic run once per tick against the register bus.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Called once when the plugin is added to a loop.
    fn init(&mut self, _bus: &RegisterBus) -> BusResult<()> {
        Ok(())
    }

    fn tick(&mut self, bus: &RegisterBus) -> BusResult<()>;
}

/// A device with its parameter ↔ register bindings.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    device: Device,
    readings: Vec<(String, String)>,
    commands: Vec<(String, String)>,
}

impl DeviceBinding {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            readings: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Copy `parameter` into `register` after every poll.
    pub fn reading(mut self, parameter: impl Into<String>, register: impl Into<String>) -> Self {
        self.readings.push((parameter.into(), register.into()));
        self
    }

    /// Write `register` to `parameter` whenever it changes.
    pub fn command(mut self, register: impl Into<String>, parameter: impl Into<String>) -> Self {
        self.commands.push((register.into(), parameter.into()));
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn validate(&self, bus: &RegisterBus) -> BusResult<()> {
        let label = self.device.label();
        for (parameter, register) in &self.readings {
            let param = self.device.parameter(parameter).ok_or_else(|| BusError::UnexpectedRegister {
                name: parameter.clone(),
            })?;
            if !param.access().is_read() {
                return Err(BusError::config(format!(
                    "{}: {} is {}, it cannot feed register {}",
                    label,
                    parameter,
                    param.access(),
                    register
                )));
            }
            require_register(bus, register)?;
        }
        for (register, parameter) in &self.commands {
            let param = self.device.parameter(parameter).ok_or_else(|| BusError::UnexpectedRegister {
                name: parameter.clone(),
            })?;
            if !param.access().is_write() {
                return Err(BusError::ReadOnlyParameter {
                    name: parameter.clone(),
                    kind: param.access(),
                });
            }
            require_register(bus, register)?;
        }
        Ok(())
    }
}

fn require_register(bus: &RegisterBus, name: &str) -> BusResult<()> {
    match bus.by_name(name) {
        Some(_) => Ok(()),
        None => Err(BusError::UnknownRegister {
            name: name.to_string(),
        }),
    }
}

struct Slot<T> {
    binding: DeviceBinding,
    transport: T,
    last_sent: HashMap<String, Value>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub devices_polled: usize,
    pub registers_changed: usize,
    pub unavailable: usize,
    pub plugin_failures: usize,
    pub commands_sent: usize,
    pub command_failures: usize,
}

/// Fixed-period scheduler for devices and plugins.
pub struct ControlLoop<T: Transport> {
    bus: Arc<RegisterBus>,
    errors: Arc<ErrorAggregator>,
    period: Duration,
    devices: Vec<Slot<T>>,
    plugins: Vec<Box<dyn Plugin>>,
    ticks: u64,
}

impl<T: Transport> ControlLoop<T> {
    pub fn new(bus: Arc<RegisterBus>, errors: Arc<ErrorAggregator>, period: Duration) -> Self {
        Self {
            bus,
            errors,
            period,
            devices: Vec::new(),
            plugins: Vec::new(),
            ticks: 0,
        }
    }

    pub fn bus(&self) -> &Arc<RegisterBus> {
        &self.bus
    }

    pub fn errors(&self) -> &Arc<ErrorAggregator> {
        &self.errors
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Add a device reached through `transport`.
    ///
    /// Every bound parameter and register must exist. Command registers are
    /// seeded with their current value, so nothing is written until a
    /// command register changes.
    pub fn add_device(&mut self, binding: DeviceBinding, transport: T) -> BusResult<()> {
        binding.validate(&self.bus)?;
        let last_sent = binding
            .commands
            .iter()
            .filter_map(|(register, _)| self.bus.get(register).map(|v| (register.clone(), v)))
            .collect();
        info!(
            "Control loop: added {} ({} readings, {} commands)",
            binding.device.label(),
            binding.readings.len(),
            binding.commands.len()
        );
        self.devices.push(Slot {
            binding,
            transport,
            last_sent,
        });
        Ok(())
    }

    /// Initialize and add a plugin.
    pub fn add_plugin(&mut self, mut plugin: Box<dyn Plugin>) -> BusResult<()> {
        plugin.init(&self.bus)?;
        info!("Control loop: added plugin {}", plugin.name());
        self.plugins.push(plugin);
        Ok(())
    }

    /// Run one tick.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for slot in &mut self.devices {
            let device = &slot.binding.device;
            let snapshot = device.poll(&mut slot.transport, &self.errors).await;
            report.devices_polled += 1;

            for (parameter, register) in &slot.binding.readings {
                let Some(value) = snapshot.value(parameter) else {
                    report.unavailable += 1;
                    continue;
                };
                match self.bus.set(register, value.clone()) {
                    Ok(true) => report.registers_changed += 1,
                    Ok(false) => {}
                    Err(e) => self.errors.report(
                        e.code(),
                        format!("{} {} -> {}: {}", device.label(), parameter, register, e),
                    ),
                }
            }
        }

        for plugin in &mut self.plugins {
            if let Err(e) = plugin.tick(&self.bus) {
                report.plugin_failures += 1;
                self.errors
                    .report(e.code(), format!("plugin {}: {}", plugin.name(), e));
            }
        }

        for slot in &mut self.devices {
            let device = &slot.binding.device;
            for (register, parameter) in &slot.binding.commands {
                let Some(value) = self.bus.get(register) else {
                    continue;
                };
                if slot.last_sent.get(register) == Some(&value) {
                    continue;
                }
                match device.write(parameter, &value, &mut slot.transport).await {
                    Ok(()) => {
                        report.commands_sent += 1;
                        slot.last_sent.insert(register.clone(), value);
                    }
                    Err(e) => {
                        report.command_failures += 1;
                        self.errors.report(
                            e.code(),
                            format!("{} {} <- {} = {}: {}", device.label(), parameter, register, value, e),
                        );
                        if !e.is_connection_error() {
                            slot.last_sent.insert(register.clone(), value);
                        }
                    }
                }
            }
        }

        self.ticks += 1;
        debug!("Tick {}: {:?}", self.ticks, report);
        report
    }

    /// Tick every period until `shutdown` completes.
    ///
    /// A tick in progress when `shutdown` fires runs to completion.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Control loop started: {} devices, {} plugins, period {:?}",
            self.devices.len(),
            self.plugins.len(),
            self.period
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.command_failures > 0 || report.plugin_failures > 0 {
                        warn!(
                            "Tick {}: {} command and {} plugin failures",
                            self.ticks, report.command_failures, report.plugin_failures
                        );
                    }
                }
            }
        }
        info!("Control loop stopped after {} ticks", self.ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::parameter::{AccessKind, Parameter};
    use crate::register::RegisterDef;
    use crate::sim::{Fault, SimTransport};
    use crate::value::DataType;

    struct Thermostat {
        runs: usize,
    }

    impl Plugin for Thermostat {
        fn name(&self) -> &str {
            "thermostat"
        }

        fn init(&mut self, bus: &RegisterBus) -> BusResult<()> {
            bus.subset(&["hvac.temp", "hvac.valve"]).map(|_| ())
        }

        fn tick(&mut self, bus: &RegisterBus) -> BusResult<()> {
            self.runs += 1;
            let temp = bus
                .get("hvac.temp")
                .and_then(|v| v.as_f64())
                .unwrap_or_default();
            let valve: u16 = if temp < 20.0 { 100 } else { 0 };
            bus.set("hvac.valve", valve)?;
            Ok(())
        }
    }

    fn setup() -> (ControlLoop<SimTransport>, SimTransport) {
        let clock = Arc::new(ManualClock::default());
        let bus = Arc::new(RegisterBus::with_clock(clock.clone()));
        bus.define_all([
            RegisterDef::new("hvac.temp", DataType::Int16),
            RegisterDef::new("hvac.valve", DataType::UInt16),
        ])
        .unwrap();
        let errors = Arc::new(ErrorAggregator::with_default_window(clock));

        let device = Device::new("acme", "ahu", 1)
            .with_parameter(
                Parameter::scalar("temp", AccessKind::ReadInputRegisters, DataType::Int16, 0).unwrap(),
            )
            .unwrap()
            .with_parameter(
                Parameter::scalar("valve", AccessKind::WriteSingleHoldingRegister, DataType::UInt16, 10)
                    .unwrap()
                    .with_range(0.0, 100.0),
            )
            .unwrap();

        let sim = SimTransport::new();
        sim.set_input(1, 0, &[18]);
        sim.set_holding(1, 10, &[0]);

        let mut control = ControlLoop::new(bus, errors, Duration::from_millis(10));
        control
            .add_device(
                DeviceBinding::new(device)
                    .reading("temp", "hvac.temp")
                    .command("hvac.valve", "valve"),
                sim.clone(),
            )
            .unwrap();
        control.add_plugin(Box::new(Thermostat { runs: 0 })).unwrap();
        (control, sim)
    }

    #[tokio::test]
    async fn test_tick_polls_runs_and_writes() {
        let (mut control, sim) = setup();

        let report = control.tick().await;
        assert_eq!(control.bus().get("hvac.temp"), Some(Value::Int16(18)));
        assert_eq!(report.commands_sent, 1);
        assert_eq!(sim.holding(1, 10), Some(100));

        sim.clear_requests();
        let report = control.tick().await;
        assert_eq!(report.commands_sent, 0);
        assert_eq!(report.registers_changed, 0);
        assert_eq!(sim.requests().len(), 1);

        sim.set_input(1, 0, &[23]);
        control.tick().await;
        assert_eq!(sim.holding(1, 10), Some(0));
        assert_eq!(control.ticks(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_reading_keeps_previous_value() {
        let (mut control, sim) = setup();
        control.tick().await;

        sim.inject_fault(1, AccessKind::ReadInputRegisters, 0..1, Fault::Exception(0x04));
        sim.set_input(1, 0, &[30]);
        let report = control.tick().await;

        assert_eq!(report.unavailable, 1);
        assert_eq!(control.bus().get("hvac.temp"), Some(Value::Int16(18)));
        assert_eq!(control.errors().snapshot()[0].code, ErrorCode::DeviceException);
    }

    #[tokio::test]
    async fn test_rejected_command_is_not_retried() {
        let (mut control, sim) = setup();
        control.plugins.clear();
        control.bus().set("hvac.valve", 500u16).unwrap();

        let report = control.tick().await;
        assert_eq!(report.command_failures, 1);
        assert_eq!(sim.holding(1, 10), Some(0));
        assert_eq!(control.errors().snapshot()[0].code, ErrorCode::BadRegisterValue);

        let report = control.tick().await;
        assert_eq!(report.command_failures, 0);
    }

    #[test]
    fn test_add_device_validates_bindings() {
        let (mut control, sim) = setup();
        let device = Device::new("acme", "x", 2)
            .with_parameter(
                Parameter::scalar("t", AccessKind::ReadInputRegisters, DataType::Int16, 0).unwrap(),
            )
            .unwrap();

        let missing_register = DeviceBinding::new(device.clone()).reading("t", "nope");
        assert!(matches!(
            control.add_device(missing_register, sim.clone()).unwrap_err(),
            BusError::UnknownRegister { .. }
        ));

        let read_only = DeviceBinding::new(device.clone()).command("hvac.valve", "t");
        assert!(matches!(
            control.add_device(read_only, sim.clone()).unwrap_err(),
            BusError::ReadOnlyParameter { .. }
        ));

        let unknown = DeviceBinding::new(device).reading("missing", "hvac.temp");
        assert!(matches!(
            control.add_device(unknown, sim).unwrap_err(),
            BusError::UnexpectedRegister { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (mut control, _sim) = setup();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            let _ = tx.send(());
        });
        control
            .run(async {
                let _ = rx.await;
            })
            .await;
        assert!(control.ticks() >= 2);
    }
}
