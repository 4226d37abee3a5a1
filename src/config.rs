//! # Controller Configuration
//!
//! YAML document read once at startup. Every field has a default, so an empty
//! document is a valid (device-less) configuration.
//!
//! ```yaml
//! tick_ms: 1000
//! request_timeout_ms: 500
//! schema_path: /etc/regbus/registers.csv
//! persistence_path: /var/lib/regbus/state.json
//! error_window_secs: 60
//! error_register: system.errors
//! log_level: info
//!
//! buses:
//!   - name: rs485-0
//!     transport: { kind: rtu, path: /dev/ttyUSB0, baud_rate: 9600 }
//!   - name: plant
//!     transport: { kind: tcp, address: "192.168.1.20:502" }
//!
//! devices:
//!   - bus: plant
//!     vendor: generic
//!     model: energy_meter
//!     unit_id: 1
//!     readings:
//!       - { parameter: voltage, register: meter.voltage }
//!
//! webhook:
//!   bind: "0.0.0.0:8080"
//!   identifications:
//!     - { dev: temp, circuit: 28-0316a2, register: outdoor.temp }
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ERROR_REGISTER, DEFAULT_ERROR_WINDOW_SECS, DEFAULT_QUEUE_DEPTH,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TICK_MS,
};
use crate::error::{BusError, BusResult};
use crate::webhook::{Identification, IdentificationMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_ms: u64,
    pub request_timeout_ms: u64,
    pub schema_path: Option<PathBuf>,
    pub persistence_path: Option<PathBuf>,
    pub error_window_secs: u64,
    /// `string` register receiving the error window. Defined automatically
    /// when the schema does not declare it.
    pub error_register: Option<String>,
    pub log_level: String,
    pub buses: Vec<BusConfig>,
    pub devices: Vec<DeviceConfig>,
    pub webhook: Option<WebhookConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            schema_path: None,
            persistence_path: None,
            error_window_secs: DEFAULT_ERROR_WINDOW_SECS,
            error_register: Some(DEFAULT_ERROR_REGISTER.to_string()),
            log_level: "info".to_string(),
            buses: Vec::new(),
            devices: Vec::new(),
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        address: SocketAddr,
    },
    Rtu {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// In-memory simulated slave.
    Sim,
}

fn default_baud_rate() -> u32 {
    9600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub bus: String,
    pub vendor: String,
    pub model: String,
    pub unit_id: u8,
    #[serde(default)]
    pub readings: Vec<ReadingBinding>,
    #[serde(default)]
    pub commands: Vec<CommandBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingBinding {
    pub parameter: String,
    pub register: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBinding {
    pub register: String,
    pub parameter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub bind: SocketAddr,
    #[serde(default)]
    pub identifications: Vec<Identification>,
}

impl WebhookConfig {
    pub fn identification_map(&self) -> IdentificationMap {
        self.identifications.iter().cloned().collect()
    }
}

impl ControllerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> BusResult<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| BusError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BusError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.tick_ms == 0 {
            return Err(BusError::config("tick_ms must be greater than zero"));
        }
        if self.request_timeout_ms == 0 {
            return Err(BusError::config("request_timeout_ms must be greater than zero"));
        }
        if self.error_window_secs == 0 {
            return Err(BusError::config("error_window_secs must be greater than zero"));
        }
        if self.request_timeout_ms >= self.tick_ms {
            tracing::warn!(
                "request_timeout_ms ({}) is not shorter than tick_ms ({}), ticks will overrun",
                self.request_timeout_ms,
                self.tick_ms
            );
        }

        let mut buses = HashSet::new();
        for bus in &self.buses {
            if !buses.insert(bus.name.as_str()) {
                return Err(BusError::config(format!("duplicate bus name '{}'", bus.name)));
            }
            if bus.queue_depth == 0 {
                return Err(BusError::config(format!("bus '{}': queue_depth must be at least 1", bus.name)));
            }
        }

        let mut units = HashSet::new();
        for device in &self.devices {
            if !buses.contains(device.bus.as_str()) {
                return Err(BusError::config(format!(
                    "device {}/{} refers to unknown bus '{}'",
                    device.vendor, device.model, device.bus
                )));
            }
            if !units.insert((device.bus.as_str(), device.unit_id)) {
                return Err(BusError::config(format!(
                    "unit id {} is used twice on bus '{}'",
                    device.unit_id, device.bus
                )));
            }
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}
