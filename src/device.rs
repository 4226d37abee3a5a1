//! # Devices
//!
//! A [`Device`] is an ordered set of [`Parameter`]s behind one unit id. It
//! holds no reference to the register bus: [`Device::poll`] hands back typed
//! readings and [`Device::write`] takes a typed value, both through whatever
//! [`Transport`] the caller supplies.
//!
//! ## Poll semantics
//!
//! The read plan is executed request by request. A failed request (timeout,
//! exception, short frame) is reported once to the [`ErrorAggregator`] and
//! marks its parameters [`Reading::Unavailable`]; the remaining requests still
//! run. Decoding and range failures mark only the affected parameter.
//!
//! A parameter wider than the device's read ceiling arrives in several
//! requests. Its pieces are reassembled before decoding, and it is
//! unavailable if any piece fails.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use tracing::{debug, warn};

use crate::aggregator::ErrorAggregator;
use crate::batcher::{build_read_plan, BatchMember, BatchRequest};
use crate::codec::{decode, decode_bits, encode, encode_bits};
use crate::device_limits::DeviceLimits;
use crate::error::{BusError, BusResult, ErrorCode};
use crate::parameter::{AccessKind, Parameter};
use crate::transport::{RawData, Transport};
use crate::value::{DataType, Value};

/// Outcome for one parameter in a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(Value),
    Unavailable(ErrorCode),
}

impl Reading {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Reading::Value(value) => Some(value),
            Reading::Unavailable(_) => None,
        }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Value(_))
    }
}

/// Result of one [`Device::poll`], in parameter declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSnapshot {
    readings: Vec<(String, Reading)>,
    failed_requests: usize,
}

impl PollSnapshot {
    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, reading)| reading)
    }

    /// Decoded value of `name`, if it was read successfully.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(Reading::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.readings.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn available(&self) -> usize {
        self.readings.iter().filter(|(_, r)| r.is_available()).count()
    }

    pub fn unavailable(&self) -> Vec<&str> {
        self.readings
            .iter()
            .filter(|(_, r)| !r.is_available())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Number of transport requests that failed.
    pub fn failed_requests(&self) -> usize {
        self.failed_requests
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// A field device bound to one unit id.
#[derive(Debug, Clone)]
pub struct Device {
    vendor: String,
    model: String,
    unit_id: u8,
    limits: DeviceLimits,
    parameters: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl Device {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>, unit_id: u8) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            unit_id,
            limits: DeviceLimits::default(),
            parameters: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builder form of [`Device::add_parameter`].
    pub fn with_parameter(mut self, parameter: Parameter) -> BusResult<Self> {
        self.add_parameter(parameter)?;
        Ok(self)
    }

    /// Append a parameter. Names are unique per device.
    pub fn add_parameter(&mut self, parameter: Parameter) -> BusResult<()> {
        if self.index.contains_key(parameter.name()) {
            return Err(BusError::DuplicateParameter {
                device: self.label(),
                name: parameter.name().to_string(),
            });
        }
        self.index
            .insert(parameter.name().to_string(), self.parameters.len());
        self.parameters.push(parameter);
        Ok(())
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// `vendor/model@unit`
    pub fn label(&self) -> String {
        format!("{}/{}@{}", self.vendor, self.model, self.unit_id)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.parameters[i])
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn build_read_plan(&self) -> Vec<BatchRequest> {
        build_read_plan(&self.parameters, &self.limits)
    }

    /// Execute the read plan once.
    pub async fn poll<T: Transport>(&self, transport: &mut T, errors: &ErrorAggregator) -> PollSnapshot {
        let plan = self.build_read_plan();
        let mut readings: Vec<Option<Reading>> = vec![None; self.parameters.len()];
        let mut pieces: HashMap<usize, Assembly> = HashMap::new();
        let mut failed_requests = 0;

        for (n, batch) in plan.iter().enumerate() {
            if n > 0 && !self.limits.inter_request_delay.is_zero() {
                tokio::time::sleep(self.limits.inter_request_delay).await;
            }

            match self.read_batch(transport, batch).await {
                Ok(data) => {
                    for member in &batch.members {
                        let param = &self.parameters[member.index];
                        if member.is_whole(param) {
                            let reading = self.decode_span(member.index, &data, member.span(), errors);
                            readings[member.index] = Some(reading);
                            continue;
                        }
                        if readings[member.index].is_some() {
                            continue;
                        }
                        let assembly = pieces
                            .entry(member.index)
                            .or_insert_with(|| Assembly::new(&data, param.len()));
                        if assembly.fill(&data, member) {
                            let whole = 0..usize::from(param.len());
                            let reading = self.decode_span(member.index, &assembly.data, whole, errors);
                            readings[member.index] = Some(reading);
                        }
                    }
                }
                Err(e) => {
                    failed_requests += 1;
                    errors.report(
                        e.code(),
                        format!(
                            "{} {} @{} x{}: {}",
                            self.label(),
                            batch.access,
                            batch.start,
                            batch.count,
                            e
                        ),
                    );
                    for member in &batch.members {
                        readings[member.index] = Some(Reading::Unavailable(e.code()));
                    }
                }
            }
        }

        let snapshot = PollSnapshot {
            readings: self
                .parameters
                .iter()
                .zip(readings)
                .filter_map(|(p, r)| r.map(|r| (p.name().to_string(), r)))
                .collect(),
            failed_requests,
        };
        debug!(
            "Polled {}: {}/{} available, {} failed request(s)",
            self.label(),
            snapshot.available(),
            snapshot.len(),
            failed_requests
        );
        snapshot
    }

    async fn read_batch<T: Transport>(&self, transport: &mut T, batch: &BatchRequest) -> BusResult<RawData> {
        let mut attempt = 0u8;
        loop {
            let result = transport
                .read(
                    self.unit_id,
                    batch.access,
                    batch.start,
                    batch.count,
                    self.limits.request_timeout,
                )
                .await
                .and_then(|data| check_shape(data, batch));

            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_connection_error() || attempt >= self.limits.max_retries => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    debug!(
                        "Retrying {} {} @{} ({}/{}): {}",
                        self.label(),
                        batch.access,
                        batch.start,
                        attempt,
                        self.limits.max_retries,
                        e
                    );
                }
            }
        }
    }

    fn decode_span(&self, index: usize, data: &RawData, span: Range<usize>, errors: &ErrorAggregator) -> Reading {
        let param = &self.parameters[index];
        let decoded = match data {
            RawData::Bits(bits) => decode_bits(&bits[span]),
            RawData::Words(words) => decode(&words[span], param.data_type(), param.word_order()),
        }
        .and_then(|value| {
            if let Some(range) = param.valid_range() {
                range.check(param.name(), &value)?;
            }
            Ok(value)
        });

        match decoded {
            Ok(value) => Reading::Value(value),
            Err(e) => {
                errors.report(e.code(), format!("{} {}: {}", self.label(), param.name(), e));
                Reading::Unavailable(e.code())
            }
        }
    }

    /// Encode `value` and write it to parameter `name`.
    ///
    /// Multi-word values on a single-register parameter go out as one
    /// write per word, in address order.
    pub async fn write<T: Transport>(&self, name: &str, value: &Value, transport: &mut T) -> BusResult<()> {
        let param = self.parameter(name).ok_or_else(|| BusError::UnexpectedRegister {
            name: name.to_string(),
        })?;
        let kind = param.access();
        let timeout = self.limits.request_timeout;

        match kind {
            AccessKind::WriteSingleHoldingRegister => {
                let value = value.clone().coerce(param.data_type())?;
                if let Some(range) = param.valid_range() {
                    range.check(name, &value)?;
                }
                let mut words = encode(&value, param.data_type(), param.word_order())?;
                if param.data_type() == DataType::String {
                    let width = param.addresses().len();
                    if words.len() > width {
                        return Err(BusError::bad_data_type(format!(
                            "{}: '{}' needs {} registers, {} declared",
                            name,
                            value,
                            words.len(),
                            width
                        )));
                    }
                    words.resize(width, 0);
                }

                for (&address, word) in param.addresses().iter().zip(words) {
                    transport
                        .write(self.unit_id, kind, address, RawData::Words(vec![word]), timeout)
                        .await?;
                }
            }
            AccessKind::WriteMultipleCoils => {
                if let Some(range) = param.valid_range() {
                    range.check(name, value)?;
                }
                let bits = encode_bits(value, param.addresses().len())?;
                let chunk = usize::from(self.limits.ceiling_for(kind).max(1));
                for (n, piece) in bits.chunks(chunk).enumerate() {
                    let start = param.start() + (n * chunk) as u16;
                    transport
                        .write(self.unit_id, kind, start, RawData::Bits(piece.to_vec()), timeout)
                        .await?;
                }
            }
            read_kind => {
                return Err(BusError::ReadOnlyParameter {
                    name: name.to_string(),
                    kind: read_kind,
                });
            }
        }
        debug!("Wrote {} = {} on {}", name, value, self.label());
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Words or bits of one split parameter, filled piece by piece.
struct Assembly {
    data: RawData,
    received: usize,
}

impl Assembly {
    fn new(like: &RawData, len: u16) -> Self {
        let len = usize::from(len);
        let data = match like {
            RawData::Words(_) => RawData::Words(vec![0; len]),
            RawData::Bits(_) => RawData::Bits(vec![false; len]),
        };
        Self { data, received: 0 }
    }

    /// Copy `member`'s slice of `source` into place. True once complete.
    fn fill(&mut self, source: &RawData, member: &BatchMember) -> bool {
        let at = usize::from(member.part);
        let span = member.span();
        let len = span.len();
        match (&mut self.data, source) {
            (RawData::Words(target), RawData::Words(words)) => {
                target[at..at + len].copy_from_slice(&words[span]);
            }
            (RawData::Bits(target), RawData::Bits(bits)) => {
                target[at..at + len].copy_from_slice(&bits[span]);
            }
            _ => return false,
        }
        self.received += len;
        self.received == self.data.len()
    }
}

fn check_shape(data: RawData, batch: &BatchRequest) -> BusResult<RawData> {
    let shape_ok = match &data {
        RawData::Bits(_) => batch.access.is_bit_access(),
        RawData::Words(_) => !batch.access.is_bit_access(),
    };
    if !shape_ok {
        warn!("{} answered with the wrong payload type", batch.access);
        return Err(BusError::protocol(format!(
            "{} response carries the wrong payload type",
            batch.access
        )));
    }
    if data.len() != usize::from(batch.count) {
        return Err(BusError::protocol(format!(
            "short frame: expected {} items, got {}",
            batch.count,
            data.len()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::{Fault, SimRequest, SimTransport};
    use std::sync::Arc;

    fn errors() -> ErrorAggregator {
        ErrorAggregator::with_default_window(Arc::new(ManualClock::default()))
    }

    fn ahu() -> Device {
        Device::new("acme", "ahu", 1)
            .with_parameter(
                Parameter::scalar("supply_temp", AccessKind::ReadInputRegisters, DataType::Float, 0)
                    .unwrap()
                    .with_range(-40.0, 120.0),
            )
            .unwrap()
            .with_parameter(
                Parameter::scalar("fan_speed", AccessKind::ReadInputRegisters, DataType::UInt16, 2)
                    .unwrap(),
            )
            .unwrap()
            .with_parameter(Parameter::bit_array("alarms", AccessKind::ReadDiscreteInput, 0, 4).unwrap())
            .unwrap()
            .with_parameter(
                Parameter::scalar(
                    "setpoint",
                    AccessKind::WriteSingleHoldingRegister,
                    DataType::UInt16,
                    10,
                )
                .unwrap()
                .with_range(0.0, 100.0),
            )
            .unwrap()
    }

    #[test]
    fn test_duplicate_parameter() {
        let mut device = ahu();
        let err = device
            .add_parameter(
                Parameter::scalar("fan_speed", AccessKind::ReadHoldingRegisters, DataType::UInt16, 9)
                    .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateParameter { .. }));
        assert_eq!(device.parameters().len(), 4);
    }

    #[test]
    fn test_build_read_plan_skips_writes() {
        let plan = ahu().build_read_plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].access, AccessKind::ReadDiscreteInput);
        assert_eq!((plan[1].start, plan[1].count), (0, 3));
    }

    #[tokio::test]
    async fn test_poll_decodes_all() {
        let mut sim = SimTransport::new();
        let [hi, lo] = crate::bytes::WordOrder::BigEndian.split(21.5f32.to_bits());
        sim.set_input(1, 0, &[hi, lo, 1200]);
        sim.set_discrete(1, 0, &[true, false, false, true]);

        let errors = errors();
        let snapshot = ahu().poll(&mut sim, &errors).await;

        assert_eq!(snapshot.value("supply_temp"), Some(&Value::Float(21.5)));
        assert_eq!(snapshot.value("fan_speed"), Some(&Value::UInt16(1200)));
        assert_eq!(snapshot.value("alarms"), Some(&Value::UInt16(0b1001)));
        assert!(snapshot.get("setpoint").is_none());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_poll_range_failure_marks_one_parameter() {
        let mut sim = SimTransport::new();
        let words = crate::bytes::WordOrder::BigEndian.split(500.0f32.to_bits());
        sim.set_input(1, 0, &[words[0], words[1], 7]);
        sim.set_discrete(1, 0, &[false; 4]);

        let errors = errors();
        let snapshot = ahu().poll(&mut sim, &errors).await;

        assert_eq!(
            snapshot.get("supply_temp"),
            Some(&Reading::Unavailable(ErrorCode::BadRegisterValue))
        );
        assert_eq!(snapshot.value("fan_speed"), Some(&Value::UInt16(7)));
        assert_eq!(errors.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_exception_is_isolated() {
        let mut sim = SimTransport::new();
        sim.set_input(1, 0, &[0, 0, 5]);
        sim.set_discrete(1, 0, &[false; 4]);
        sim.inject_fault(1, AccessKind::ReadDiscreteInput, 0..4, Fault::Exception(0x04));

        let errors = errors();
        let snapshot = ahu().poll(&mut sim, &errors).await;

        assert_eq!(
            snapshot.get("alarms"),
            Some(&Reading::Unavailable(ErrorCode::DeviceException))
        );
        assert_eq!(snapshot.value("fan_speed"), Some(&Value::UInt16(5)));
        assert_eq!(snapshot.failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_poll_retries_non_timeout_failures() {
        let mut sim = SimTransport::new();
        sim.set_coils(1, 0, &[true]);
        sim.inject_fault(1, AccessKind::ReadCoil, 0..1, Fault::ShortFrame);
        let device = Device::new("acme", "relay", 1)
            .with_limits(DeviceLimits::new().with_max_retries(2))
            .with_parameter(Parameter::bit_array("k1", AccessKind::ReadCoil, 0, 1).unwrap())
            .unwrap();

        let errors = errors();
        let snapshot = device.poll(&mut sim, &errors).await;

        assert_eq!(snapshot.get("k1"), Some(&Reading::Unavailable(ErrorCode::ProtocolError)));
        assert_eq!(sim.requests().len(), 3);
        assert_eq!(errors.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_reassembles_split_parameters() {
        let mut sim = SimTransport::new();
        let label = crate::bytes::string_to_words("AHU-1 ROOF WEST").unwrap();
        sim.set_holding(1, 0, &label);
        let [hi, lo] = crate::bytes::WordOrder::BigEndian.split(18.25f32.to_bits());
        sim.set_input(1, 40, &[hi, lo]);

        let device = Device::new("acme", "ahu", 1)
            .with_limits(DeviceLimits::new().with_max_read_registers(1))
            .with_parameter(Parameter::string("label", AccessKind::ReadHoldingRegisters, 0, 8).unwrap())
            .unwrap()
            .with_parameter(
                Parameter::scalar("return_temp", AccessKind::ReadInputRegisters, DataType::Float, 40)
                    .unwrap(),
            )
            .unwrap();

        let errors = errors();
        let snapshot = device.poll(&mut sim, &errors).await;

        assert_eq!(snapshot.value("label"), Some(&Value::from("AHU-1 ROOF WEST")));
        assert_eq!(snapshot.value("return_temp"), Some(&Value::Float(18.25)));
        assert!(errors.is_empty());

        let requests = sim.requests();
        assert_eq!(requests.len(), 10);
        assert!(requests.iter().all(|r| r.count == 1));
    }

    #[tokio::test]
    async fn test_split_parameter_unavailable_when_a_piece_fails() {
        let mut sim = SimTransport::new();
        sim.set_holding(1, 0, &[0x4142; 6]);
        sim.inject_fault(1, AccessKind::ReadHoldingRegisters, 4..6, Fault::Exception(0x02));

        let device = Device::new("acme", "panel", 1)
            .with_limits(DeviceLimits::new().with_max_read_registers(4))
            .with_parameter(Parameter::string("label", AccessKind::ReadHoldingRegisters, 0, 6).unwrap())
            .unwrap();

        let errors = errors();
        let snapshot = device.poll(&mut sim, &errors).await;

        assert_eq!(
            snapshot.get("label"),
            Some(&Reading::Unavailable(ErrorCode::DeviceException))
        );
        assert_eq!(snapshot.failed_requests(), 1);
        assert_eq!(errors.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_coil_write_split_to_ceiling() {
        let mut sim = SimTransport::new();
        let device = Device::new("acme", "relay", 1)
            .with_limits(DeviceLimits::new().with_max_write_coils(3))
            .with_parameter(Parameter::bit_array("outputs", AccessKind::WriteMultipleCoils, 10, 8).unwrap())
            .unwrap();

        device.write("outputs", &Value::UInt16(0b1000_0001), &mut sim).await.unwrap();

        let requests: Vec<(u16, u16)> = sim.requests().iter().map(|r| (r.start, r.count)).collect();
        assert_eq!(requests, vec![(10, 3), (13, 3), (16, 2)]);
        assert_eq!(sim.coil(1, 10), Some(true));
        assert_eq!(sim.coil(1, 11), Some(false));
        assert_eq!(sim.coil(1, 17), Some(true));
    }

    #[tokio::test]
    async fn test_write_unknown_and_read_only() {
        let mut sim = SimTransport::new();
        let device = ahu();
        assert!(matches!(
            device.write("nope", &Value::UInt16(1), &mut sim).await.unwrap_err(),
            BusError::UnexpectedRegister { .. }
        ));
        assert!(matches!(
            device.write("fan_speed", &Value::UInt16(1), &mut sim).await.unwrap_err(),
            BusError::ReadOnlyParameter {
                kind: AccessKind::ReadInputRegisters,
                ..
            }
        ));
        assert!(sim.requests().is_empty());
    }

    #[tokio::test]
    async fn test_write_range_and_type_checks() {
        let mut sim = SimTransport::new();
        let device = ahu();
        assert!(matches!(
            device.write("setpoint", &Value::UInt16(500), &mut sim).await.unwrap_err(),
            BusError::BadRegisterValue { .. }
        ));
        assert!(matches!(
            device.write("setpoint", &Value::Float(2.5), &mut sim).await.unwrap_err(),
            BusError::BadRegisterDataType { .. }
        ));
        assert!(sim.requests().is_empty());

        device.write("setpoint", &Value::Int32(55), &mut sim).await.unwrap();
        assert_eq!(sim.holding(1, 10), Some(55));
    }

    #[tokio::test]
    async fn test_multi_word_write_goes_word_by_word() {
        let mut sim = SimTransport::new();
        let device = Device::new("acme", "meter", 3)
            .with_parameter(
                Parameter::from_tag("limit", AccessKind::WriteSingleHoldingRegister, "uint32_LE", 20)
                    .unwrap(),
            )
            .unwrap();

        device.write("limit", &Value::UInt32(0x12345678), &mut sim).await.unwrap();

        let requests: Vec<(u16, Option<RawData>)> = sim
            .requests()
            .into_iter()
            .map(|SimRequest { start, data, .. }| (start, data))
            .collect();
        assert_eq!(
            requests,
            vec![
                (20, Some(RawData::Words(vec![0x5678]))),
                (21, Some(RawData::Words(vec![0x1234]))),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_coils_and_string() {
        let mut sim = SimTransport::new();
        let device = Device::new("acme", "panel", 1)
            .with_parameter(Parameter::bit_array("relays", AccessKind::WriteMultipleCoils, 0, 4).unwrap())
            .unwrap()
            .with_parameter(
                Parameter::string("label", AccessKind::WriteSingleHoldingRegister, 100, 2).unwrap(),
            )
            .unwrap();

        device.write("relays", &Value::UInt16(0b1010), &mut sim).await.unwrap();
        assert_eq!(sim.coil(1, 0), Some(true));
        assert_eq!(sim.coil(1, 1), Some(false));
        assert_eq!(sim.coil(1, 2), Some(true));

        device.write("label", &Value::from("AB"), &mut sim).await.unwrap();
        assert_eq!(sim.holding(1, 100), Some(0x4142));
        assert_eq!(sim.holding(1, 101), Some(0));
        assert!(device.write("label", &Value::from("TOO LONG"), &mut sim).await.is_err());
    }
}
