//! # Modbus TCP Transport
//!
//! MBAP framing over a lazily (re)connected `TcpStream`:
//!
//! ```text
//! | Transaction ID (2) | Protocol ID (2) | Length (2) | Unit ID (1) | PDU |
//! ```
//!
//! An exchange that is abandoned mid-flight (its future dropped by the bus
//! queue timeout) leaves the stream in an unknown state; the next exchange
//! reconnects. Responses carrying an older transaction id are late answers to
//! abandoned requests and are skipped.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{BusError, BusResult};
use crate::parameter::AccessKind;
use crate::pdu::{check_write_response, parse_read_response, Pdu, PduBuilder};
use crate::transport::{RawData, Transport};

/// Modbus TCP client endpoint.
#[derive(Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    next_transaction_id: u16,
    in_flight: bool,
}

impl TcpTransport {
    /// Endpoint that connects on first use.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            next_transaction_id: 1,
            in_flight: false,
        }
    }

    /// Endpoint connected up front.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> BusResult<Self> {
        let mut transport = Self::new(addr);
        transport.ensure_connected(timeout).await?;
        Ok(transport)
    }

    pub fn server_address(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn ensure_connected(&mut self, timeout: Duration) -> BusResult<()> {
        if self.in_flight {
            warn!("Dropping connection to {} after an abandoned exchange", self.addr);
            self.stream = None;
            self.in_flight = false;
        }
        if self.stream.is_none() {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| BusError::no_connection(format!("connect to {} timed out", self.addr)))?
                .map_err(|e| BusError::no_connection(format!("connect to {}: {}", self.addr, e)))?;
            stream.set_nodelay(true)?;
            info!("Connected to Modbus TCP server {}", self.addr);
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn next_tid(&mut self) -> u16 {
        let tid = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        tid
    }

    /// Send one request PDU and return the response PDU.
    pub async fn exchange(&mut self, unit_id: u8, request: &Pdu, timeout: Duration) -> BusResult<Vec<u8>> {
        self.ensure_connected(timeout).await?;
        let transaction_id = self.next_tid();

        self.in_flight = true;
        let result = tokio::time::timeout(timeout, self.round_trip(transaction_id, unit_id, request)).await;
        self.in_flight = false;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if matches!(e, BusError::Io(_) | BusError::NoConnectionWithPLC { .. }) {
                    self.stream = None;
                }
                Err(e)
            }
            Err(_) => {
                self.stream = None;
                Err(BusError::no_connection(format!(
                    "{} unit {} did not answer within {:?}",
                    self.addr, unit_id, timeout
                )))
            }
        }
    }

    async fn round_trip(&mut self, transaction_id: u16, unit_id: u8, request: &Pdu) -> BusResult<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BusError::no_connection("not connected"))?;

        let frame = encode_frame(transaction_id, unit_id, request.as_slice());
        debug!("TCP send tid={} unit={} {:02X?}", transaction_id, unit_id, &frame[..]);
        stream.write_all(&frame).await?;

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            read_exact(stream, &mut header).await?;
            let mbap = MbapHeader::decode(&header)?;

            let mut pdu = vec![0u8; usize::from(mbap.length) - 1];
            read_exact(stream, &mut pdu).await?;
            debug!("TCP recv tid={} unit={} {:02X?}", mbap.transaction_id, mbap.unit_id, pdu);

            if mbap.transaction_id != transaction_id {
                if is_stale(mbap.transaction_id, transaction_id) {
                    debug!("Skipping late response tid={}", mbap.transaction_id);
                    continue;
                }
                return Err(BusError::protocol(format!(
                    "transaction id mismatch: expected {}, got {}",
                    transaction_id, mbap.transaction_id
                )));
            }
            if mbap.unit_id != unit_id {
                return Err(BusError::protocol(format!(
                    "unit id mismatch: expected {}, got {}",
                    unit_id, mbap.unit_id
                )));
            }
            return Ok(pdu);
        }
    }
}

/// Decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(bytes: &[u8; MBAP_HEADER_LEN]) -> BusResult<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(BusError::protocol(format!(
                "invalid protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || usize::from(header.length) > MAX_MBAP_LENGTH {
            return Err(BusError::protocol(format!("invalid MBAP length {}", header.length)));
        }
        Ok(header)
    }
}

/// MBAP header followed by the PDU.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16(pdu.len() as u16 + 1);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame
}

fn is_stale(received: u16, expected: u16) -> bool {
    let behind = expected.wrapping_sub(received);
    behind != 0 && behind < 0x8000
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> BusResult<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BusError::no_connection("connection closed by peer"))
        }
        Err(e) => Err(e.into()),
    }
}

impl Transport for TcpTransport {
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
