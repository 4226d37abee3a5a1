//! # Modbus RTU Framing
//!
//! ```text
//! | Address (1) | PDU | CRC-16/MODBUS (2, low byte first) |
//! ```
//!
//! Frame helpers are always available. The serial transport itself needs the
//! `rtu` feature.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{FC_WRITE_MULTIPLE_COILS, FC_WRITE_SINGLE_REGISTER, MAX_RTU_FRAME_SIZE};
use crate::error::{BusError, BusResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `bytes`.
#[inline]
pub fn crc16(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// Address, PDU and CRC.
pub fn encode_rtu_frame(unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Verify a frame's CRC and split it into unit id and PDU.
pub fn decode_rtu_frame(frame: &[u8]) -> BusResult<(u8, &[u8])> {
    if frame.len() < 4 {
        return Err(BusError::protocol(format!("RTU frame too short: {} bytes", frame.len())));
    }
    if frame.len() > MAX_RTU_FRAME_SIZE {
        return Err(BusError::protocol(format!("RTU frame too long: {} bytes", frame.len())));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(BusError::protocol(format!(
            "CRC mismatch: received {:04X}, computed {:04X}",
            received, computed
        )));
    }
    Ok((body[0], &body[1..]))
}

/// Total response frame length, known once its first three bytes
/// (address, function, byte count or exception code) have arrived.
pub fn response_frame_len(head: &[u8; 3]) -> BusResult<usize> {
    let function = head[1];
    if function & 0x80 != 0 {
        return Ok(5);
    }
    match function {
        0x01..=0x04 => Ok(3 + usize::from(head[2]) + 2),
        FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_COILS => Ok(8),
        other => Err(BusError::protocol(format!("unexpected function code {:02X}", other))),
    }
}

/// Silent interval (3.5 character times) before a frame.
pub fn inter_frame_delay(baud_rate: u32) -> std::time::Duration {
    if baud_rate > 19_200 {
        return std::time::Duration::from_micros(1750);
    }
    // 11 bits per character
    let micros = 3.5 * 11.0 * 1_000_000.0 / f64::from(baud_rate.max(1));
    std::time::Duration::from_micros(micros.ceil() as u64)
}

#[cfg(feature = "rtu")]
pub use serial::RtuTransport;

#[cfg(feature = "rtu")]
mod serial {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
    use tracing::{debug, info};

    use super::{decode_rtu_frame, encode_rtu_frame, inter_frame_delay, response_frame_len};
    use crate::error::{BusError, BusResult};
    use crate::parameter::AccessKind;
    use crate::pdu::{check_write_response, parse_read_response, Pdu, PduBuilder};
    use crate::transport::{RawData, Transport};

    /// Modbus RTU master on a serial port.
    #[derive(Debug)]
    pub struct RtuTransport {
        port: SerialStream,
        path: String,
        delay: Duration,
    }

    impl RtuTransport {
        pub fn open(path: &str, baud_rate: u32) -> BusResult<Self> {
            let port = tokio_serial::new(path, baud_rate)
                .open_native_async()
                .map_err(|e| BusError::no_connection(format!("open {}: {}", path, e)))?;
            info!("Opened RTU port {} at {} baud", path, baud_rate);
            Ok(Self {
                port,
                path: path.to_string(),
                delay: inter_frame_delay(baud_rate),
            })
        }

        async fn exchange(&mut self, unit_id: u8, request: &Pdu, timeout: Duration) -> BusResult<Vec<u8>> {
            let _ = self.port.clear(ClearBuffer::Input);
            tokio::time::sleep(self.delay).await;

            let frame = encode_rtu_frame(unit_id, request.as_slice());
            debug!("RTU send {} {:02X?}", self.path, &frame[..]);
            self.port.write_all(&frame).await?;

            let response = tokio::time::timeout(timeout, read_frame(&mut self.port))
                .await
                .map_err(|_| {
                    BusError::no_connection(format!(
                        "{} unit {} did not answer within {:?}",
                        self.path, unit_id, timeout
                    ))
                })??;
            debug!("RTU recv {} {:02X?}", self.path, response);

            let (address, pdu) = decode_rtu_frame(&response)?;
            if address != unit_id {
                return Err(BusError::protocol(format!(
                    "unit id mismatch: expected {}, got {}",
                    unit_id, address
                )));
            }
            Ok(pdu.to_vec())
        }
    }

    async fn read_frame(port: &mut SerialStream) -> BusResult<Vec<u8>> {
        let mut head = [0u8; 3];
        port.read_exact(&mut head).await?;
        let total = response_frame_len(&head)?;
        let mut frame = vec![0u8; total];
        frame[..3].copy_from_slice(&head);
        port.read_exact(&mut frame[3..]).await?;
        Ok(frame)
    }

    impl Transport for RtuTransport {
        async fn read(
            &mut self,
            unit_id: u8,
            kind: AccessKind,
            start: u16,
            count: u16,
            timeout: Duration,
        ) -> BusResult<RawData> {
            let request = PduBuilder::read_request(kind, start, count)?;
            let response = self.exchange(unit_id, &request, timeout).await?;
            parse_read_response(&response, kind, count)
        }

        async fn write(
            &mut self,
            unit_id: u8,
            kind: AccessKind,
            start: u16,
            data: RawData,
            timeout: Duration,
        ) -> BusResult<()> {
            let request = PduBuilder::write_request(kind, start, &data)?;
            let response = self.exchange(unit_id, &request, timeout).await?;
            check_write_response(&response, &request)
        }
    }
}
