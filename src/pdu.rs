//! Modbus PDU building and parsing
//!
//! Requests are built into a fixed-size stack buffer. Responses are parsed
//! straight from the received slice into [`RawData`].

use tracing::debug;

use crate::constants::{
    exception_description, FC_WRITE_MULTIPLE_COILS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
};
use crate::error::{BusError, BusResult};
use crate::parameter::AccessKind;
use crate::transport::RawData;

/// PDU with a stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct Pdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl Pdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU
    pub fn from_slice(data: &[u8]) -> BusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(BusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> BusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(BusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> BusResult<()> {
        for byte in value.to_be_bytes() {
            self.push(byte)?;
        }
        Ok(())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> BusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(BusError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            _ => "Unknown Function",
        }
    }
}

impl Default for Pdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Request builders
pub struct PduBuilder;

impl PduBuilder {
    /// Read request for FC01-04
    pub fn read_request(kind: AccessKind, start: u16, count: u16) -> BusResult<Pdu> {
        let ceiling = match kind {
            AccessKind::ReadCoil | AccessKind::ReadDiscreteInput => MAX_READ_COILS,
            AccessKind::ReadHoldingRegisters | AccessKind::ReadInputRegisters => MAX_READ_REGISTERS,
            _ => {
                return Err(BusError::protocol(format!("{} is not a read kind", kind)));
            }
        };
        if count == 0 || count > ceiling {
            return Err(BusError::protocol(format!(
                "{} quantity {} outside 1..={}",
                kind, count, ceiling
            )));
        }

        let mut pdu = Pdu::new();
        pdu.push(kind.function_code())?;
        pdu.push_u16(start)?;
        pdu.push_u16(count)?;
        debug!(
            "PDU built: FC={:02X} ({}) start={} count={}",
            kind.function_code(),
            Pdu::function_code_description(kind.function_code()),
            start,
            count
        );
        Ok(pdu)
    }

    /// FC06
    pub fn write_single_register(address: u16, value: u16) -> BusResult<Pdu> {
        let mut pdu = Pdu::new();
        pdu.push(FC_WRITE_SINGLE_REGISTER)?;
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    /// FC15. Coils are packed LSB-first within each byte.
    pub fn write_multiple_coils(address: u16, values: &[bool]) -> BusResult<Pdu> {
        if values.is_empty() || values.len() > usize::from(MAX_WRITE_COILS) {
            return Err(BusError::protocol(format!(
                "coil count {} outside 1..={}",
                values.len(),
                MAX_WRITE_COILS
            )));
        }

        let mut pdu = Pdu::new();
        pdu.push(FC_WRITE_MULTIPLE_COILS)?;
        pdu.push_u16(address)?;
        pdu.push_u16(values.len() as u16)?;
        let packed = pack_coils(values);
        pdu.push(packed.len() as u8)?;
        pdu.extend(&packed)?;
        Ok(pdu)
    }

    /// Write request for a write access kind and payload.
    pub fn write_request(kind: AccessKind, start: u16, data: &RawData) -> BusResult<Pdu> {
        match (kind, data) {
            (AccessKind::WriteSingleHoldingRegister, RawData::Words(words)) if words.len() == 1 => {
                Self::write_single_register(start, words[0])
            }
            (AccessKind::WriteMultipleCoils, RawData::Bits(bits)) => {
                Self::write_multiple_coils(start, bits)
            }
            _ => Err(BusError::protocol(format!(
                "{} cannot carry {} item(s) of this payload",
                kind,
                data.len()
            ))),
        }
    }
}

/// Pack coils LSB-first within each byte, as they travel on the wire.
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` coils from wire bytes.
pub fn unpack_coils(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

fn check_function(response: &[u8], expected: u8) -> BusResult<()> {
    let Some(&function) = response.first() else {
        return Err(BusError::protocol("empty response PDU"));
    };
    if function == expected | 0x80 {
        let code = response
            .get(1)
            .copied()
            .ok_or_else(|| BusError::protocol("exception response without code"))?;
        return Err(BusError::Exception {
            function: expected,
            code,
            message: exception_description(code).to_string(),
        });
    }
    if function != expected {
        return Err(BusError::protocol(format!(
            "function code mismatch: expected {:02X}, got {:02X}",
            expected, function
        )));
    }
    Ok(())
}

/// Parse the response to a read request of `count` items.
pub fn parse_read_response(response: &[u8], kind: AccessKind, count: u16) -> BusResult<RawData> {
    check_function(response, kind.function_code())?;
    let byte_count = *response
        .get(1)
        .ok_or_else(|| BusError::protocol("missing byte count"))? as usize;
    let payload = &response[2..];
    if payload.len() != byte_count {
        return Err(BusError::protocol(format!(
            "byte count {} but {} bytes received",
            byte_count,
            payload.len()
        )));
    }

    let count = usize::from(count);
    if kind.is_bit_access() {
        if byte_count != count.div_ceil(8) {
            return Err(BusError::protocol(format!(
                "expected {} coil bytes, got {}",
                count.div_ceil(8),
                byte_count
            )));
        }
        Ok(RawData::Bits(unpack_coils(payload, count)))
    } else {
        if byte_count != count * 2 {
            return Err(BusError::protocol(format!(
                "expected {} register bytes, got {}",
                count * 2,
                byte_count
            )));
        }
        Ok(RawData::Words(
            payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        ))
    }
}

/// Check the echo of a write request.
pub fn check_write_response(response: &[u8], request: &Pdu) -> BusResult<()> {
    let function = request
        .function_code()
        .ok_or_else(|| BusError::protocol("empty request PDU"))?;
    check_function(response, function)?;
    // FC06 and FC15 both echo function, address and a 16-bit value/quantity.
    if response.len() != 5 || response[..5] != request.as_slice()[..5] {
        return Err(BusError::protocol("write response does not echo the request"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = Pdu::new();
        assert!(pdu.is_empty());
        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.function_code(), Some(0x03));
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = Pdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert!(pdu.push(1).is_err());
        assert!(Pdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }

    #[test]
    fn test_read_request() {
        let pdu = PduBuilder::read_request(AccessKind::ReadHoldingRegisters, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert!(PduBuilder::read_request(AccessKind::ReadInputRegisters, 0, 126).is_err());
        assert!(PduBuilder::read_request(AccessKind::WriteMultipleCoils, 0, 1).is_err());
    }

    #[test]
    fn test_write_single_register() {
        let pdu = PduBuilder::write_single_register(0x0001, 0x0003).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let bits = [true, false, true, true, false, false, true, true, true, false];
        let pdu = PduBuilder::write_multiple_coils(0x0013, &bits).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_parse_register_response() {
        let response = [0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        let data = parse_read_response(&response, AccessKind::ReadHoldingRegisters, 3).unwrap();
        assert_eq!(data, RawData::Words(vec![0x022B, 0x0000, 0x0064]));
    }

    #[test]
    fn test_parse_coil_response() {
        let response = [0x01, 0x02, 0xCD, 0x01];
        let data = parse_read_response(&response, AccessKind::ReadCoil, 10).unwrap();
        assert_eq!(
            data,
            RawData::Bits(vec![true, false, true, true, false, false, true, true, true, false])
        );
    }

    #[test]
    fn test_parse_short_response() {
        let response = [0x03, 0x04, 0x00, 0x01];
        let err = parse_read_response(&response, AccessKind::ReadHoldingRegisters, 2).unwrap_err();
        assert!(matches!(err, BusError::Protocol { .. }));
    }

    #[test]
    fn test_parse_exception_response() {
        let err = parse_read_response(&[0x83, 0x02], AccessKind::ReadHoldingRegisters, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Exception {
                function: 0x03,
                code: 0x02,
                ..
            }
        ));
    }

    #[test]
    fn test_check_write_response() {
        let request = PduBuilder::write_single_register(1, 3).unwrap();
        assert!(check_write_response(request.as_slice(), &request).is_ok());
        assert!(check_write_response(&[0x06, 0x00, 0x01, 0x00, 0x04], &request).is_err());
        assert!(matches!(
            check_write_response(&[0x86, 0x04], &request).unwrap_err(),
            BusError::Exception { code: 0x04, .. }
        ));
    }

    #[test]
    fn test_coil_packing() {
        let bits = vec![true, false, false, false, false, false, false, false, true];
        assert_eq!(pack_coils(&bits), vec![0x01, 0x01]);
        assert_eq!(unpack_coils(&[0x01, 0x01], 9), bits);
    }
}
