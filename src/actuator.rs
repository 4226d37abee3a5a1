//! # Actuator Positioning
//!
//! ```text
//!        off target              enabled             within tolerance
//! Idle ────────────▶ Prepare ────────────▶ Moving ───────────────────▶ Settled
//!  ▲                    ▲                                                 │
//!  │                    └──────────────── off target ─────────────────────┤
//!  └──────────────────────────────── settle_ticks elapsed ────────────────┘
//! ```
//!
//! [`step`] is a pure transition function; [`ActuatorPlugin`] drives it from
//! register values once per control-loop tick.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::control::Plugin;
use crate::error::{BusError, BusResult};
use crate::register::RegisterBus;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorState {
    #[default]
    Idle,
    Prepare,
    Moving,
    Settled,
}

impl ActuatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Prepare => "prepare",
            Self::Moving => "moving",
            Self::Settled => "settled",
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readings fed to [`step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorInputs {
    pub target: f64,
    pub position: f64,
    pub tolerance: f64,
    /// Drive reports it is powered and ready.
    pub enabled: bool,
    /// Target of the last `Drive` command, if one was sent.
    pub commanded: Option<f64>,
    /// Ticks spent in the current state.
    pub ticks_in_state: u32,
    /// Ticks to stay in `Settled` before returning to `Idle`.
    pub settle_ticks: u32,
}

impl ActuatorInputs {
    fn on_target(&self) -> bool {
        (self.target - self.position).abs() <= self.tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorCommand {
    Enable,
    Drive(f64),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub next: ActuatorState,
    pub command: Option<ActuatorCommand>,
}

impl Transition {
    fn stay(state: ActuatorState) -> Self {
        Self::to_silent(state)
    }

    /// Change state without sending anything to the drive.
    fn to_silent(next: ActuatorState) -> Self {
        Self {
            next,
            command: None,
        }
    }

    fn to(next: ActuatorState, command: ActuatorCommand) -> Self {
        Self {
            next,
            command: Some(command),
        }
    }
}

/// Next state and command for `state` given `inputs`.
pub fn step(state: ActuatorState, inputs: &ActuatorInputs) -> Transition {
    use ActuatorState::*;

    match state {
        Idle if inputs.on_target() => Transition::stay(Idle),
        Idle => Transition::to(Prepare, ActuatorCommand::Enable),
        Prepare if inputs.enabled => Transition::to(Moving, ActuatorCommand::Drive(inputs.target)),
        Prepare => Transition::stay(Prepare),
        Moving if inputs.on_target() => Transition::to(Settled, ActuatorCommand::Stop),
        Moving if inputs.commanded != Some(inputs.target) => {
            Transition::to(Moving, ActuatorCommand::Drive(inputs.target))
        }
        Moving => Transition::stay(Moving),
        Settled if !inputs.on_target() => Transition::to(Prepare, ActuatorCommand::Enable),
        Settled if inputs.ticks_in_state >= inputs.settle_ticks => Transition::to_silent(Idle),
        Settled => Transition::stay(Settled),
    }
}

/// Register names an [`ActuatorPlugin`] works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorRegisters {
    pub target: String,
    pub position: String,
    pub enable_feedback: String,
    pub enable_command: String,
    pub drive_command: String,
    /// Optional `string` register receiving the state name.
    pub state: Option<String>,
}

/// Runs one actuator FSM per tick against the register bus.
#[derive(Debug)]
pub struct ActuatorPlugin {
    name: String,
    registers: ActuatorRegisters,
    tolerance: f64,
    settle_ticks: u32,
    state: ActuatorState,
    ticks_in_state: u32,
    commanded: Option<f64>,
}

impl ActuatorPlugin {
    pub fn new(name: impl Into<String>, registers: ActuatorRegisters, tolerance: f64) -> Self {
        Self {
            name: name.into(),
            registers,
            tolerance,
            settle_ticks: 3,
            state: ActuatorState::Idle,
            ticks_in_state: 0,
            commanded: None,
        }
    }

    pub fn with_settle_ticks(mut self, ticks: u32) -> Self {
        self.settle_ticks = ticks;
        self
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    fn number(bus: &RegisterBus, name: &str) -> BusResult<f64> {
        bus.get(name)
            .ok_or_else(|| BusError::UnknownRegister {
                name: name.to_string(),
            })?
            .as_f64()
            .ok_or_else(|| BusError::bad_data_type(format!("{} is not numeric", name)))
    }

    fn flag(bus: &RegisterBus, name: &str) -> BusResult<bool> {
        let value = bus.get(name).ok_or_else(|| BusError::UnknownRegister {
            name: name.to_string(),
        })?;
        Ok(value.as_bool().unwrap_or_else(|| value.as_f64().is_some_and(|v| v != 0.0)))
    }
}

impl Plugin for ActuatorPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, bus: &RegisterBus) -> BusResult<()> {
        let r = &self.registers;
        let mut names = vec![
            r.target.as_str(),
            r.position.as_str(),
            r.enable_feedback.as_str(),
            r.enable_command.as_str(),
            r.drive_command.as_str(),
        ];
        names.extend(r.state.as_deref());
        bus.subset(&names)?;
        if let Some(state) = &r.state {
            bus.set(state, self.state.as_str())?;
        }
        Ok(())
    }

    fn tick(&mut self, bus: &RegisterBus) -> BusResult<()> {
        let inputs = ActuatorInputs {
            target: Self::number(bus, &self.registers.target)?,
            position: Self::number(bus, &self.registers.position)?,
            tolerance: self.tolerance,
            enabled: Self::flag(bus, &self.registers.enable_feedback)?,
            commanded: self.commanded,
            ticks_in_state: self.ticks_in_state,
            settle_ticks: self.settle_ticks,
        };
        let transition = step(self.state, &inputs);

        match transition.command {
            Some(ActuatorCommand::Enable) => {
                bus.set(&self.registers.enable_command, true)?;
            }
            Some(ActuatorCommand::Drive(target)) => {
                bus.set(&self.registers.drive_command, Value::Float(target as f32))?;
                self.commanded = Some(target);
            }
            Some(ActuatorCommand::Stop) => {
                bus.set(&self.registers.enable_command, false)?;
                self.commanded = None;
            }
            None => {}
        }

        if transition.next == self.state {
            self.ticks_in_state = self.ticks_in_state.saturating_add(1);
        } else {
            debug!("Actuator {}: {} -> {}", self.name, self.state, transition.next);
            self.state = transition.next;
            self.ticks_in_state = 0;
            if let Some(state) = &self.registers.state {
                bus.set(state, self.state.as_str())?;
            }
        }
        Ok(())
    }
}
