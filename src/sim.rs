//! # Simulated Slave
//!
//! In-memory multi-unit Modbus slave implementing [`Transport`]. Backs the demo
//! binary and the test-suite. Faults can be injected per unit, access kind and
//! address range.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::{
    exception_description, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    EXCEPTION_ILLEGAL_FUNCTION,
};
use crate::error::{BusError, BusResult};
use crate::parameter::AccessKind;
use crate::transport::{RawData, Transport};

/// Injected failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Wait out the caller's timeout, then fail with `NoConnectionWithPLC`.
    Timeout,
    /// Never answer. Only useful behind a [`BusQueue`](crate::BusQueue).
    Hang,
    /// Answer with a Modbus exception code.
    Exception(u8),
    /// Answer with fewer items than requested.
    ShortFrame,
}

#[derive(Debug, Clone)]
struct FaultRule {
    unit_id: u8,
    kind: AccessKind,
    range: Range<u16>,
    fault: Fault,
}

impl FaultRule {
    fn matches(&self, unit_id: u8, kind: AccessKind, start: u16, count: u16) -> bool {
        let end = u32::from(start) + u32::from(count);
        self.unit_id == unit_id
            && self.kind == kind
            && u32::from(self.range.start) < end
            && u32::from(start) < u32::from(self.range.end)
    }
}

/// One request as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRequest {
    pub unit_id: u8,
    pub kind: AccessKind,
    pub start: u16,
    pub count: u16,
    pub data: Option<RawData>,
}

#[derive(Debug, Default)]
struct UnitMemory {
    coils: BTreeMap<u16, bool>,
    discrete: BTreeMap<u16, bool>,
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
}

#[derive(Debug, Default)]
struct SimState {
    units: HashMap<u8, UnitMemory>,
    faults: Vec<FaultRule>,
    log: Vec<SimRequest>,
}

/// Shared in-memory slave. Clones see the same memory.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, unit_id: u8, start: u16, words: &[u16]) {
        let mut state = self.state.lock();
        let unit = state.units.entry(unit_id).or_default();
        for (address, word) in (start..).zip(words) {
            unit.holding.insert(address, *word);
        }
    }

    pub fn set_input(&self, unit_id: u8, start: u16, words: &[u16]) {
        let mut state = self.state.lock();
        let unit = state.units.entry(unit_id).or_default();
        for (address, word) in (start..).zip(words) {
            unit.input.insert(address, *word);
        }
    }

    pub fn set_coils(&self, unit_id: u8, start: u16, bits: &[bool]) {
        let mut state = self.state.lock();
        let unit = state.units.entry(unit_id).or_default();
        for (address, bit) in (start..).zip(bits) {
            unit.coils.insert(address, *bit);
        }
    }

    pub fn set_discrete(&self, unit_id: u8, start: u16, bits: &[bool]) {
        let mut state = self.state.lock();
        let unit = state.units.entry(unit_id).or_default();
        for (address, bit) in (start..).zip(bits) {
            unit.discrete.insert(address, *bit);
        }
    }

    pub fn holding(&self, unit_id: u8, address: u16) -> Option<u16> {
        let state = self.state.lock();
        state.units.get(&unit_id)?.holding.get(&address).copied()
    }

    pub fn coil(&self, unit_id: u8, address: u16) -> Option<bool> {
        let state = self.state.lock();
        state.units.get(&unit_id)?.coils.get(&address).copied()
    }

    /// Fail requests of `kind` to `unit_id` that touch `range`.
    pub fn inject_fault(&self, unit_id: u8, kind: AccessKind, range: Range<u16>, fault: Fault) {
        self.state.lock().faults.push(FaultRule {
            unit_id,
            kind,
            range,
            fault,
        });
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<SimRequest> {
        self.state.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }

    fn fault_for(&self, unit_id: u8, kind: AccessKind, start: u16, count: u16) -> Option<Fault> {
        self.state
            .lock()
            .faults
            .iter()
            .find(|rule| rule.matches(unit_id, kind, start, count))
            .map(|rule| rule.fault)
    }

    fn serve_read(&self, unit_id: u8, kind: AccessKind, start: u16, count: u16) -> BusResult<RawData> {
        let function = kind.function_code();
        if !kind.is_read() {
            return Err(exception(function, EXCEPTION_ILLEGAL_FUNCTION));
        }
        if count == 0 || u32::from(start) + u32::from(count) > u32::from(u16::MAX) + 1 {
            return Err(exception(function, EXCEPTION_ILLEGAL_DATA_VALUE));
        }

        let mut state = self.state.lock();
        state.log.push(SimRequest {
            unit_id,
            kind,
            start,
            count,
            data: None,
        });
        let unit = state
            .units
            .get(&unit_id)
            .ok_or_else(|| BusError::no_connection(format!("unit {} does not answer", unit_id)))?;

        let addresses = (u32::from(start)..u32::from(start) + u32::from(count)).map(|a| a as u16);
        let missing = || exception(function, EXCEPTION_ILLEGAL_DATA_ADDRESS);
        let data = match kind {
            AccessKind::ReadCoil => RawData::Bits(
                addresses
                    .map(|a| unit.coils.get(&a).copied().ok_or_else(missing))
                    .collect::<BusResult<_>>()?,
            ),
            AccessKind::ReadDiscreteInput => RawData::Bits(
                addresses
                    .map(|a| unit.discrete.get(&a).copied().ok_or_else(missing))
                    .collect::<BusResult<_>>()?,
            ),
            AccessKind::ReadHoldingRegisters => RawData::Words(
                addresses
                    .map(|a| unit.holding.get(&a).copied().ok_or_else(missing))
                    .collect::<BusResult<_>>()?,
            ),
            AccessKind::ReadInputRegisters => RawData::Words(
                addresses
                    .map(|a| unit.input.get(&a).copied().ok_or_else(missing))
                    .collect::<BusResult<_>>()?,
            ),
            AccessKind::WriteSingleHoldingRegister | AccessKind::WriteMultipleCoils => {
                return Err(exception(function, EXCEPTION_ILLEGAL_FUNCTION));
            }
        };
        Ok(data)
    }

    fn serve_write(&self, unit_id: u8, kind: AccessKind, start: u16, data: RawData) -> BusResult<()> {
        let function = kind.function_code();
        let mut state = self.state.lock();
        state.log.push(SimRequest {
            unit_id,
            kind,
            start,
            count: data.len() as u16,
            data: Some(data.clone()),
        });
        let unit = state.units.entry(unit_id).or_default();

        match (kind, data) {
            (AccessKind::WriteSingleHoldingRegister, RawData::Words(words)) if words.len() == 1 => {
                unit.holding.insert(start, words[0]);
            }
            (AccessKind::WriteMultipleCoils, RawData::Bits(bits)) if !bits.is_empty() => {
                if u32::from(start) + bits.len() as u32 > u32::from(u16::MAX) + 1 {
                    return Err(exception(function, EXCEPTION_ILLEGAL_DATA_ADDRESS));
                }
                for (address, bit) in (start..).zip(bits) {
                    unit.coils.insert(address, bit);
                }
            }
            (kind, _) if kind.is_write() => {
                return Err(exception(function, EXCEPTION_ILLEGAL_DATA_VALUE));
            }
            _ => return Err(exception(function, EXCEPTION_ILLEGAL_FUNCTION)),
        }
        Ok(())
    }
}

fn exception(function: u8, code: u8) -> BusError {
    BusError::Exception {
        function,
        code,
        message: exception_description(code).to_string(),
    }
}

async fn inject(fault: Fault, function: u8, timeout: Duration) -> BusError {
    match fault {
        Fault::Timeout => {
            tokio::time::sleep(timeout).await;
            BusError::no_connection(format!("request timed out after {:?}", timeout))
        }
        Fault::Hang => std::future::pending().await,
        Fault::Exception(code) => exception(function, code),
        Fault::ShortFrame => BusError::protocol("short frame"),
    }
}

impl Transport for SimTransport {
    async fn read(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> BusResult<RawData> {
        debug!("Sim read unit {} {} @{} x{}", unit_id, kind, start, count);
        match self.fault_for(unit_id, kind, start, count) {
            Some(Fault::ShortFrame) => {
                let mut data = self.serve_read(unit_id, kind, start, count)?;
                match &mut data {
                    RawData::Words(words) => {
                        words.pop();
                    }
                    RawData::Bits(bits) => {
                        bits.pop();
                    }
                }
                Ok(data)
            }
            Some(fault) => Err(inject(fault, kind.function_code(), timeout).await),
            None => self.serve_read(unit_id, kind, start, count),
        }
    }

    async fn write(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        data: RawData,
        timeout: Duration,
    ) -> BusResult<()> {
        debug!("Sim write unit {} {} @{} x{}", unit_id, kind, start, data.len());
        match self.fault_for(unit_id, kind, start, data.len() as u16) {
            Some(fault) => Err(inject(fault, kind.function_code(), timeout).await),
            None => self.serve_write(unit_id, kind, start, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_read_mapped_registers() {
        let mut sim = SimTransport::new();
        sim.set_input(2, 100, &[1, 2, 3]);
        let data = sim
            .read(2, AccessKind::ReadInputRegisters, 101, 2, T)
            .await
            .unwrap();
        assert_eq!(data, RawData::Words(vec![2, 3]));
    }

    #[tokio::test]
    async fn test_unmapped_address_is_exception() {
        let mut sim = SimTransport::new();
        sim.set_holding(1, 0, &[1]);
        let err = sim
            .read(1, AccessKind::ReadHoldingRegisters, 0, 2, T)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Exception { function: 0x03, code: 0x02, .. }));
    }

    #[tokio::test]
    async fn test_unknown_unit_is_no_connection() {
        let mut sim = SimTransport::new();
        let err = sim.read(9, AccessKind::ReadCoil, 0, 1, T).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_write_single_and_coils() {
        let mut sim = SimTransport::new();
        sim.write(1, AccessKind::WriteSingleHoldingRegister, 5, RawData::Words(vec![42]), T)
            .await
            .unwrap();
        sim.write(1, AccessKind::WriteMultipleCoils, 0, RawData::Bits(vec![true, false]), T)
            .await
            .unwrap();
        assert_eq!(sim.holding(1, 5), Some(42));
        assert_eq!(sim.coil(1, 0), Some(true));
        assert_eq!(sim.coil(1, 1), Some(false));

        let err = sim
            .write(1, AccessKind::WriteSingleHoldingRegister, 5, RawData::Words(vec![1, 2]), T)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Exception { code: 0x03, .. }));
        assert_eq!(sim.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let mut sim = SimTransport::new();
        sim.set_holding(1, 0, &[1, 2, 3, 4]);
        sim.inject_fault(1, AccessKind::ReadHoldingRegisters, 2..3, Fault::Exception(0x04));
        sim.inject_fault(1, AccessKind::ReadHoldingRegisters, 3..4, Fault::Timeout);

        assert!(sim.read(1, AccessKind::ReadHoldingRegisters, 0, 2, T).await.is_ok());
        let err = sim
            .read(1, AccessKind::ReadHoldingRegisters, 1, 2, T)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Exception { code: 0x04, .. }));
        let err = sim
            .read(1, AccessKind::ReadHoldingRegisters, 3, 1, T)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());

        sim.clear_faults();
        assert!(sim.read(1, AccessKind::ReadHoldingRegisters, 0, 4, T).await.is_ok());
    }

    #[tokio::test]
    async fn test_short_frame_fault() {
        let mut sim = SimTransport::new();
        sim.set_coils(1, 0, &[true, true, false]);
        sim.inject_fault(1, AccessKind::ReadCoil, 0..3, Fault::ShortFrame);
        let data = sim.read(1, AccessKind::ReadCoil, 0, 3, T).await.unwrap();
        assert_eq!(data.len(), 2);
    }
}
