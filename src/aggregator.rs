//! # Error Aggregator
//!
//! Time-windowed record of recent failures. Every report is logged and,
//! once bound with [`ErrorAggregator::publish_to`], the whole window is
//! published as JSON into a `string` register so operators see it on the bus.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::clock::SharedClock;
use crate::constants::DEFAULT_ERROR_WINDOW_SECS;
use crate::error::{BusError, BusResult, ErrorCode};
use crate::register::RegisterBus;
use crate::value::DataType;

/// One failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug)]
struct Sink {
    bus: Arc<RegisterBus>,
    register: String,
}

/// Rolling window of [`ErrorRecord`]s.
#[derive(Debug)]
pub struct ErrorAggregator {
    clock: SharedClock,
    window: TimeDelta,
    records: Mutex<VecDeque<ErrorRecord>>,
    sink: RwLock<Option<Sink>>,
    publishing: ReentrantMutex<()>,
}

impl ErrorAggregator {
    pub fn new(clock: SharedClock, window: Duration) -> Self {
        Self {
            clock,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            records: Mutex::new(VecDeque::new()),
            sink: RwLock::new(None),
            publishing: ReentrantMutex::new(()),
        }
    }

    /// Aggregator with the default 60 s window.
    pub fn with_default_window(clock: SharedClock) -> Self {
        Self::new(clock, Duration::from_secs(DEFAULT_ERROR_WINDOW_SECS))
    }

    pub fn window(&self) -> Duration {
        self.window.to_std().unwrap_or(Duration::MAX)
    }

    /// Append a record, then drop everything older than the window.
    pub fn report(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!("[{}] {}", code, message);

        let _publishing = self.publishing.lock();
        let now = self.clock.now();
        let json = {
            let mut records = self.records.lock();
            records.push_back(ErrorRecord {
                timestamp: now,
                code,
                message,
            });
            while let Some(front) = records.front() {
                if now - front.timestamp > self.window {
                    records.pop_front();
                } else {
                    break;
                }
            }
            self.sink
                .read()
                .is_some()
                .then(|| serde_json::to_string(&*records))
        };

        if let Some(json) = json {
            self.publish(json);
        }
    }

    /// Report an error under its own code.
    pub fn report_error(&self, error: &BusError) {
        self.report(error.code(), error.to_string());
    }

    /// Records still inside the window, oldest first.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        let now = self.clock.now();
        self.records
            .lock()
            .iter()
            .filter(|r| now - r.timestamp <= self.window)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish the window into `register` on every report.
    ///
    /// The register must exist and be a `string` register. The current
    /// window is published immediately.
    pub fn publish_to(&self, bus: Arc<RegisterBus>, register: &str) -> BusResult<()> {
        let target = bus.by_name(register).ok_or_else(|| BusError::UnknownRegister {
            name: register.to_string(),
        })?;
        if target.data_type() != DataType::String {
            return Err(BusError::bad_data_type(format!(
                "{} is {}, the error window publishes into a string register",
                register,
                target.data_type()
            )));
        }

        *self.sink.write() = Some(Sink {
            bus,
            register: register.to_string(),
        });

        let _publishing = self.publishing.lock();
        let json = serde_json::to_string(&self.snapshot());
        self.publish(json);
        Ok(())
    }

    fn publish(&self, json: serde_json::Result<String>) {
        let sink = self
            .sink
            .read()
            .as_ref()
            .map(|s| (s.bus.clone(), s.register.clone()));
        let Some((bus, register)) = sink else {
            return;
        };
        let result = json
            .map_err(BusError::from)
            .and_then(|json| bus.set(&register, json));
        if let Err(e) = result {
            warn!("Failed to publish error window to {}: {}", register, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::register::RegisterDef;
    use crate::value::Value;

    fn aggregator() -> (Arc<ManualClock>, ErrorAggregator) {
        let clock = Arc::new(ManualClock::default());
        let errors = ErrorAggregator::with_default_window(clock.clone());
        (clock, errors)
    }

    #[test]
    fn test_window_drops_expired_records() {
        let (clock, errors) = aggregator();
        errors.report(ErrorCode::NoConnectionWithPLC, "first");
        clock.advance_secs(61);
        errors.report(ErrorCode::DeviceException, "second");

        let records = errors.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "second");
    }

    #[test]
    fn test_records_inside_window_are_kept() {
        let (clock, errors) = aggregator();
        errors.report(ErrorCode::NoConnectionWithPLC, "first");
        clock.advance_secs(60);
        errors.report(ErrorCode::NoConnectionWithPLC, "second");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_snapshot_hides_stale_records() {
        let (clock, errors) = aggregator();
        errors.report(ErrorCode::ProtocolError, "short frame");
        clock.advance_secs(120);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_report_error_uses_code() {
        let (_, errors) = aggregator();
        errors.report_error(&BusError::no_connection("unit 3 timed out"));
        let records = errors.snapshot();
        assert_eq!(records[0].code, ErrorCode::NoConnectionWithPLC);
        assert!(records[0].message.contains("unit 3 timed out"));
    }

    #[test]
    fn test_publish_to_string_register() {
        let (_, errors) = aggregator();
        let bus = Arc::new(RegisterBus::new());
        bus.define(RegisterDef::new("system.errors", DataType::String))
            .unwrap();

        errors.publish_to(bus.clone(), "system.errors").unwrap();
        assert_eq!(bus.get("system.errors"), Some(Value::from("[]")));

        errors.report(ErrorCode::BadRegisterValue, "500 outside [0, 100]");
        let Some(Value::String(json)) = bus.get("system.errors") else {
            panic!("error register is not a string");
        };
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["code"], "BadRegisterValue");
        assert_eq!(parsed[0]["message"], "500 outside [0, 100]");
    }

    #[test]
    fn test_publish_to_rejects_bad_targets() {
        let (_, errors) = aggregator();
        let bus = Arc::new(RegisterBus::new());
        bus.define(RegisterDef::new("system.count", DataType::UInt16))
            .unwrap();

        assert!(matches!(
            errors.publish_to(bus.clone(), "system.count").unwrap_err(),
            BusError::BadRegisterDataType { .. }
        ));
        assert!(matches!(
            errors.publish_to(bus, "system.missing").unwrap_err(),
            BusError::UnknownRegister { .. }
        ));
    }
}
