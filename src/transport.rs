//! # Transport Layer
//!
//! The [`Transport`] trait is the only way devices talk to the field bus.
//! Implementations: [`TcpTransport`](crate::TcpTransport),
//! `RtuTransport` (feature `rtu`), [`SimTransport`](crate::SimTransport)
//! and the queue handle [`BusHandle`].
//!
//! # Bus Queue
//!
//! A half-duplex bus carries one exchange at a time. [`BusQueue::spawn`] moves a
//! transport into a worker task that serves requests strictly FIFO. Every
//! request carries its own timeout; when it expires the in-flight future is
//! dropped, the caller gets `NoConnectionWithPLC`, and the worker moves on to
//! the next request. The exchange is abandoned at this layer only; bytes
//! already on the wire are not recalled.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_regbus::{AccessKind, BusQueue, SimTransport, Transport};
//!
//! # async fn example() -> voltage_regbus::BusResult<()> {
//! let sim = SimTransport::new();
//! sim.set_holding(1, 0, &[0x1234]);
//!
//! let (mut bus, _worker) = BusQueue::spawn("rs485-0", sim, 16);
//! let data = bus
//!     .read(1, AccessKind::ReadHoldingRegisters, 0, 1, Duration::from_millis(200))
//!     .await?;
//! assert_eq!(data.as_words(), Some(&[0x1234][..]));
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};
use crate::parameter::AccessKind;

/// Payload of one exchange: 16-bit words or single bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

impl RawData {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            RawData::Words(words) => words.len(),
            RawData::Bits(bits) => bits.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_words(&self) -> Option<&[u16]> {
        match self {
            RawData::Words(words) => Some(words),
            RawData::Bits(_) => None,
        }
    }

    pub fn as_bits(&self) -> Option<&[bool]> {
        match self {
            RawData::Bits(bits) => Some(bits),
            RawData::Words(_) => None,
        }
    }
}

/// One field-bus endpoint.
///
/// Every call carries its timeout. A call that cannot complete in time fails
/// with `NoConnectionWithPLC`.
pub trait Transport: Send {
    /// Read `count` words or bits starting at `start`.
    fn read(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> impl Future<Output = BusResult<RawData>> + Send;

    /// Write `data` starting at `start`.
    fn write(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        data: RawData,
        timeout: Duration,
    ) -> impl Future<Output = BusResult<()>> + Send;
}

/// Snapshot of a bus queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn record<T>(&self, result: &BusResult<T>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(_) => self.successes.fetch_add(1, Ordering::Relaxed),
            Err(e) if e.is_connection_error() => self.timeouts.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

enum Request {
    Read {
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        count: u16,
        timeout: Duration,
        reply: oneshot::Sender<BusResult<RawData>>,
    },
    Write {
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        data: RawData,
        timeout: Duration,
        reply: oneshot::Sender<BusResult<()>>,
    },
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Read { unit_id, kind, start, count, .. } => {
                write!(f, "Read(unit {} {} @{} x{})", unit_id, kind, start, count)
            }
            Request::Write { unit_id, kind, start, data, .. } => {
                write!(f, "Write(unit {} {} @{} x{})", unit_id, kind, start, data.len())
            }
        }
    }
}

/// Spawns the FIFO worker for one bus.
pub struct BusQueue;

impl BusQueue {
    /// Move `transport` into a worker task.
    ///
    /// `depth` bounds the number of queued requests; senders wait when it is
    /// full. The worker stops once every [`BusHandle`] is dropped.
    pub fn spawn<T>(name: impl Into<String>, transport: T, depth: usize) -> (BusHandle, JoinHandle<()>)
    where
        T: Transport + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::channel(depth.max(1));
        let counters = Arc::new(Counters::default());

        let worker = tokio::spawn(serve(name.clone(), transport, rx, counters.clone()));
        info!("Bus {} queue started (depth {})", name, depth.max(1));

        (BusHandle { name, tx, counters }, worker)
    }
}

async fn serve<T: Transport>(
    name: Arc<str>,
    mut transport: T,
    mut rx: mpsc::Receiver<Request>,
    counters: Arc<Counters>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Read {
                unit_id,
                kind,
                start,
                count,
                timeout,
                reply,
            } => {
                let started = Instant::now();
                let result = tokio::time::timeout(
                    timeout,
                    transport.read(unit_id, kind, start, count, timeout),
                )
                .await
                .unwrap_or_else(|_| Err(timed_out(&name, unit_id, kind, start, timeout)));
                debug!(
                    "Bus {} unit {} {} @{} x{} in {:?}: {}",
                    name,
                    unit_id,
                    kind,
                    start,
                    count,
                    started.elapsed(),
                    if result.is_ok() { "ok" } else { "failed" }
                );
                counters.record(&result);
                let _ = reply.send(result);
            }
            Request::Write {
                unit_id,
                kind,
                start,
                data,
                timeout,
                reply,
            } => {
                let result = tokio::time::timeout(
                    timeout,
                    transport.write(unit_id, kind, start, data, timeout),
                )
                .await
                .unwrap_or_else(|_| Err(timed_out(&name, unit_id, kind, start, timeout)));
                counters.record(&result);
                let _ = reply.send(result);
            }
        }
    }
    info!("Bus {} queue stopped", name);
}

fn timed_out(name: &str, unit_id: u8, kind: AccessKind, start: u16, timeout: Duration) -> BusError {
    warn!(
        "Bus {} unit {} {} @{} abandoned after {:?}",
        name, unit_id, kind, start, timeout
    );
    BusError::no_connection(format!(
        "bus {} unit {} {} at {} timed out after {:?}",
        name, unit_id, kind, start, timeout
    ))
}

/// Cloneable handle to a bus queue. Implements [`Transport`].
#[derive(Debug, Clone)]
pub struct BusHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Request>,
    counters: Arc<Counters>,
}

impl BusHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    /// True once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn stopped(&self) -> BusError {
        BusError::no_connection(format!("bus {} queue is not running", self.name))
    }
}

impl Transport for BusHandle {
    async fn read(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> BusResult<RawData> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request::Read {
                unit_id,
                kind,
                start,
                count,
                timeout,
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())?
    }

    async fn write(
        &mut self,
        unit_id: u8,
        kind: AccessKind,
        start: u16,
        data: RawData,
        timeout: Duration,
    ) -> BusResult<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request::Write {
                unit_id,
                kind,
                start,
                data,
                timeout,
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())?
    }
}
