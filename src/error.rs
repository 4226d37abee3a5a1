//! # Error Types
//!
//! One error enum covers the whole register-bus core. Every variant maps to an
//! [`ErrorCode`], which is what the [`ErrorAggregator`](crate::ErrorAggregator)
//! records and publishes.
//!
//! Codec, parameter and transport errors are local: a device poll turns them
//! into aggregator entries. Only schema and definition errors surfaced at
//! startup are meant to abort initialization.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::parameter::AccessKind;
use crate::register::Scope;
use crate::value::DataType;

/// Result type used throughout the crate.
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by the register bus, the codec and the device layer.
#[derive(Error, Debug)]
pub enum BusError {
    /// Decoded or encoded value falls outside the declared valid range.
    #[error("Bad register value: {message}")]
    BadRegisterValue { message: String },

    /// Type mismatch between the requested data type and the wire width,
    /// or a value that cannot be represented in the target type.
    #[error("Bad register data type: {message}")]
    BadRegisterDataType { message: String },

    /// Write to a parameter name the device does not declare.
    #[error("Unexpected register: {name}")]
    UnexpectedRegister { name: String },

    /// Transport timeout or unreachable endpoint.
    #[error("No connection with PLC: {message}")]
    NoConnectionWithPLC { message: String },

    /// No constructor registered for the `(vendor, model)` pair.
    #[error("Unsupported device: {vendor}/{model}")]
    UnsupportedDevice { vendor: String, model: String },

    /// Register name not present on the bus.
    #[error("Unknown register: {name}")]
    UnknownRegister { name: String },

    /// Register redefined with a different data type.
    #[error("Register {name} already defined as {existing}, cannot redefine as {requested}")]
    RegisterTypeConflict {
        name: String,
        existing: DataType,
        requested: DataType,
    },

    /// External writer targeted a register that is not externally writable.
    #[error("Register {name} has scope {scope}, external writes are rejected")]
    ScopeViolation { name: String, scope: Scope },

    /// Two parameters with the same name on one device.
    #[error("Duplicate parameter {name} on device {device}")]
    DuplicateParameter { device: String, name: String },

    /// Write attempted on a parameter declared with a read access kind.
    #[error("Parameter {name} is read-only ({kind})")]
    ReadOnlyParameter { name: String, kind: AccessKind },

    /// Malformed register schema.
    #[error("Schema error at line {line}: {message}")]
    Schema { line: u64, message: String },

    /// Modbus exception response from the remote unit.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Short, garbled or mismatched frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid controller configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O error outside the request path (files, sockets at bind time).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload or persistence file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BusError {
    /// Shorthand for [`BusError::BadRegisterValue`].
    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::BadRegisterValue {
            message: message.into(),
        }
    }

    /// Shorthand for [`BusError::BadRegisterDataType`].
    pub fn bad_data_type(message: impl Into<String>) -> Self {
        Self::BadRegisterDataType {
            message: message.into(),
        }
    }

    /// Shorthand for [`BusError::NoConnectionWithPLC`].
    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::NoConnectionWithPLC {
            message: message.into(),
        }
    }

    /// Shorthand for [`BusError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for [`BusError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Aggregator code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRegisterValue { .. } => ErrorCode::BadRegisterValue,
            Self::BadRegisterDataType { .. } => ErrorCode::BadRegisterDataType,
            Self::UnexpectedRegister { .. }
            | Self::UnknownRegister { .. }
            | Self::ReadOnlyParameter { .. } => ErrorCode::UnexpectedRegister,
            Self::NoConnectionWithPLC { .. } | Self::Io(_) => ErrorCode::NoConnectionWithPLC,
            Self::UnsupportedDevice { .. } => ErrorCode::UnsupportedDevice,
            Self::Exception { .. } => ErrorCode::DeviceException,
            Self::Protocol { .. } | Self::Json(_) => ErrorCode::ProtocolError,
            Self::RegisterTypeConflict { .. }
            | Self::ScopeViolation { .. }
            | Self::DuplicateParameter { .. }
            | Self::Schema { .. }
            | Self::Config { .. } => ErrorCode::Configuration,
        }
    }

    /// True for timeouts and unreachable endpoints.
    ///
    /// Timed-out requests are abandoned, never retried in-line.
    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::NoConnectionWithPLC { .. })
    }
}

/// Error classification stored in aggregator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    BadRegisterValue,
    BadRegisterDataType,
    UnexpectedRegister,
    NoConnectionWithPLC,
    UnsupportedDevice,
    DeviceException,
    ProtocolError,
    Configuration,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRegisterValue => "BadRegisterValue",
            Self::BadRegisterDataType => "BadRegisterDataType",
            Self::UnexpectedRegister => "UnexpectedRegister",
            Self::NoConnectionWithPLC => "NoConnectionWithPLC",
            Self::UnsupportedDevice => "UnsupportedDevice",
            Self::DeviceException => "DeviceException",
            Self::ProtocolError => "ProtocolError",
            Self::Configuration => "Configuration",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
