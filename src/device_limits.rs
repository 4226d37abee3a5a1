//! # Device Limits Configuration
//!
//! Per-device protocol ceilings and pacing for the read planner and the
//! poll loop. Different devices have different capabilities for read/write
//! operations.
//!
//! ## Modbus Specification Limits
//!
//! - **Read Holding/Input Registers (FC03/04)**: Max 125 registers per request
//! - **Read Coils/Discrete Inputs (FC01/02)**: Max 2000 bits per request
//! - **Write Multiple Coils (FC15)**: Max 1968 coils per request
//!
//! Some devices have lower limits; a read plan built against a
//! [`DeviceLimits`] never issues a request larger than its ceiling.

use std::time::Duration;

use crate::constants::{
    DEFAULT_REQUEST_TIMEOUT_MS, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
};
use crate::parameter::AccessKind;

/// Device-specific protocol limits.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use voltage_regbus::{AccessKind, DeviceLimits};
///
/// // A meter that only answers 50 registers per read
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(50)
///     .with_inter_request_delay(Duration::from_millis(10));
///
/// assert_eq!(limits.ceiling_for(AccessKind::ReadInputRegisters), 50);
/// assert_eq!(limits.ceiling_for(AccessKind::ReadCoil), 2000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum registers per FC03/FC04 request.
    pub max_read_registers: u16,
    /// Maximum bits per FC01/FC02 request.
    pub max_read_bits: u16,
    /// Maximum coils per FC15 request.
    pub max_write_coils: u16,
    /// Timeout applied to every request of this device.
    pub request_timeout: Duration,
    /// Minimum pause between consecutive requests.
    pub inter_request_delay: Duration,
    /// Extra attempts for a failed batch. Timeouts are never retried.
    pub max_retries: u8,
}

impl DeviceLimits {
    /// Create new device limits with default (protocol maximum) values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create limits for a conservative/slow device.
    ///
    /// - 50 registers per read
    /// - 500 coils per read/write
    /// - 10ms inter-request delay
    /// - one retry
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_read_bits: 500,
            max_write_coils: 500,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS * 2),
            inter_request_delay: Duration::from_millis(10),
            max_retries: 1,
        }
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, MAX_READ_REGISTERS);
        self
    }

    pub fn with_max_read_bits(mut self, count: u16) -> Self {
        self.max_read_bits = count.clamp(1, MAX_READ_COILS);
        self
    }

    pub fn with_max_write_coils(mut self, count: u16) -> Self {
        self.max_write_coils = count.clamp(1, MAX_WRITE_COILS);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_inter_request_delay(mut self, delay: Duration) -> Self {
        self.inter_request_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Largest request size, in addresses, for a given access kind.
    #[inline]
    pub fn ceiling_for(&self, kind: AccessKind) -> u16 {
        match kind {
            AccessKind::ReadCoil | AccessKind::ReadDiscreteInput => self.max_read_bits,
            AccessKind::ReadHoldingRegisters | AccessKind::ReadInputRegisters => {
                self.max_read_registers
            }
            AccessKind::WriteMultipleCoils => self.max_write_coils,
            AccessKind::WriteSingleHoldingRegister => 1,
        }
    }

    /// Number of read requests needed to cover `total` contiguous addresses.
    pub fn read_request_count(&self, kind: AccessKind, total: u32) -> u32 {
        if total == 0 {
            return 0;
        }
        total.div_ceil(u32::from(self.ceiling_for(kind)))
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: MAX_READ_REGISTERS,
            max_read_bits: MAX_READ_COILS,
            max_write_coils: MAX_WRITE_COILS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            inter_request_delay: Duration::ZERO,
            max_retries: 0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
