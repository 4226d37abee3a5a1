//! # Voltage RegBus - Register Bus and Modbus Decoding Core
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Runtime core of a building-automation controller. Two subsystems carry the
//! weight:
//!
//! - **Register Bus**: a named, typed, observable tag store shared by the
//!   control loop, the plugins and the inbound notification endpoint. It is
//!   the single source of truth for measured and commanded values.
//! - **Parameter/Device engine**: declarative Modbus parameters (addresses,
//!   function code, data type, word order, valid range), merged read plans,
//!   and typed decode/encode through a pluggable [`Transport`].
//!
//! ## Features
//!
//! - **Concurrent tag store**: per-register write serialization, lock-free
//!   readers, ordered change notifications with isolated subscribers
//! - **Read merging**: contiguous parameters of one function code become one
//!   request, within per-device limits
//! - **Half-duplex bus queue**: FIFO request serialization with per-request
//!   timeouts
//! - **Transports**: Modbus TCP, Modbus RTU (feature `rtu`), in-memory simulator
//! - **Error window**: recent failures published into a register as JSON
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Access kind |
//! |------|----------|-------------|
//! | 0x01 | Read Coils | `ReadCoil` |
//! | 0x02 | Read Discrete Inputs | `ReadDiscreteInput` |
//! | 0x03 | Read Holding Registers | `ReadHoldingRegisters` |
//! | 0x04 | Read Input Registers | `ReadInputRegisters` |
//! | 0x06 | Write Single Register | `WriteSingleHoldingRegister` |
//! | 0x0F | Write Multiple Coils | `WriteMultipleCoils` |
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use voltage_regbus::{
//!     AccessKind, DataType, Device, ErrorAggregator, ManualClock, Parameter, RegisterBus,
//!     RegisterDef, SimTransport, Value,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> voltage_regbus::BusResult<()> {
//! let clock = Arc::new(ManualClock::default());
//! let bus = RegisterBus::with_clock(clock.clone());
//! bus.define(RegisterDef::new("ahu.fan_speed", DataType::UInt16))?;
//!
//! let device = Device::new("acme", "ahu", 1).with_parameter(Parameter::scalar(
//!     "fan_speed",
//!     AccessKind::ReadInputRegisters,
//!     DataType::UInt16,
//!     2,
//! )?)?;
//!
//! let mut sim = SimTransport::new();
//! sim.set_input(1, 2, &[1200]);
//!
//! let errors = ErrorAggregator::with_default_window(clock);
//! let snapshot = device.poll(&mut sim, &errors).await;
//! if let Some(value) = snapshot.value("fan_speed") {
//!     bus.set("ahu.fan_speed", value.clone())?;
//! }
//! assert_eq!(bus.get("ahu.fan_speed"), Some(Value::UInt16(1200)));
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and aggregator codes
pub mod error;

/// Modbus protocol constants and controller defaults
pub mod constants;

/// Injectable time source
pub mod clock;

/// Logging setup
pub mod logging;

/// Controller configuration (YAML)
pub mod config;

// ============================================================================
// Codec and parameters
// ============================================================================

/// Typed register values and data types
pub mod value;

/// Word order and bit packing helpers
pub mod bytes;

/// Encoding and decoding between register words and typed values
pub mod codec;

/// Parameter descriptors and access kinds
pub mod parameter;

/// Per-device protocol limits
pub mod device_limits;

/// Read plan construction
pub mod batcher;

/// Devices: polling and writing parameters
pub mod device;

/// `(vendor, model)` device catalogue
pub mod registry;

// ============================================================================
// Register bus
// ============================================================================

/// Registers and the register bus
pub mod register;

/// CSV register schema
pub mod schema;

/// Persistence of registers marked `persisted`
pub mod persist;

/// Time-windowed error records
pub mod aggregator;

// ============================================================================
// Transport
// ============================================================================

/// Transport trait and FIFO bus queue
pub mod transport;

/// Stack-allocated Modbus PDU
pub mod pdu;

/// Modbus TCP transport
pub mod tcp;

/// Modbus RTU framing and serial transport
pub mod rtu;

/// In-memory simulated slave
pub mod sim;

// ============================================================================
// Control
// ============================================================================

/// Control loop and plugins
pub mod control;

/// Actuator positioning state machine
pub mod actuator;

/// Inbound value notifications
pub mod webhook;

/// Controller bootstrap and teardown
pub mod controller;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_regbus::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{BusError, BusResult, ErrorCode};

// === Codec ===
pub use bytes::{pack_bits_msb, parse_type_tag, unpack_bits_msb, WordOrder};
pub use codec::{decode, decode_bits, encode, encode_bits, registers_for_type};
pub use value::{DataType, Value};

// === Parameters and devices ===
pub use batcher::{build_read_plan, BatchMember, BatchRequest};
pub use device::{Device, PollSnapshot, Reading};
pub use device_limits::DeviceLimits;
pub use parameter::{AccessKind, Parameter, ValidRange};
pub use registry::{DeviceConstructor, DeviceRegistry};

// === Register bus ===
pub use aggregator::{ErrorAggregator, ErrorRecord};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use register::{
    ChangeEvent, ChangeHandler, HandlerError, Register, RegisterBus, RegisterDef, RegisterSubset,
    Scope, SubscriptionId,
};
pub use schema::{load_schema, parse_schema};

// === Transport ===
pub use pdu::{Pdu, PduBuilder};
pub use sim::{Fault, SimRequest, SimTransport};
pub use tcp::TcpTransport;
pub use transport::{BusHandle, BusQueue, RawData, Transport, TransportStats};

#[cfg(feature = "rtu")]
pub use rtu::RtuTransport;

// === Control ===
pub use actuator::{
    step, ActuatorCommand, ActuatorInputs, ActuatorPlugin, ActuatorRegisters, ActuatorState,
    Transition,
};
pub use config::ControllerConfig;
pub use control::{ControlLoop, DeviceBinding, Plugin, TickReport};
pub use controller::Controller;
pub use webhook::{apply_notification, apply_notification_str, Identification, IdentificationMap};

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage RegBus v{} - register bus and Modbus decoding core by Evan Liu",
        VERSION
    )
}
