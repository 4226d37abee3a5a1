//! # Controller Bootstrap
//!
//! Owns the live [`RegisterBus`] from startup to teardown:
//!
//! 1. build the bus from the schema (fatal on any schema error)
//! 2. define and bind the error-window register
//! 3. restore persisted values
//! 4. start one [`BusQueue`] per configured bus
//! 5. instantiate devices through the [`DeviceRegistry`] and bind them
//!
//! [`Controller::shutdown`] flushes persisted registers and stops the queues.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::ErrorAggregator;
use crate::clock::SharedClock;
use crate::config::{ControllerConfig, TransportConfig};
use crate::control::{ControlLoop, DeviceBinding, Plugin, TickReport};
use crate::error::{BusError, BusResult};
use crate::register::{RegisterBus, RegisterDef, Scope};
use crate::registry::DeviceRegistry;
use crate::sim::SimTransport;
use crate::tcp::TcpTransport;
use crate::transport::{BusHandle, BusQueue};
use crate::value::DataType;

pub struct Controller {
    config: ControllerConfig,
    bus: Arc<RegisterBus>,
    errors: Arc<ErrorAggregator>,
    control: ControlLoop<BusHandle>,
    workers: Vec<JoinHandle<()>>,
    sims: HashMap<String, SimTransport>,
}

impl Controller {
    /// Bring up the register bus, the bus queues and the devices.
    pub async fn init(config: ControllerConfig, registry: &DeviceRegistry, clock: SharedClock) -> BusResult<Self> {
        config.validate()?;

        let bus = Arc::new(match &config.schema_path {
            Some(path) => RegisterBus::from_schema_path(path, clock.clone())?,
            None => RegisterBus::with_clock(clock.clone()),
        });

        let errors = Arc::new(ErrorAggregator::new(clock, config.error_window()));
        if let Some(name) = &config.error_register {
            if bus.by_name(name).is_none() {
                bus.define(
                    RegisterDef::new(name.as_str(), DataType::String)
                        .with_scope(Scope::System)
                        .with_description("Recent errors (JSON)"),
                )?;
            }
            errors.publish_to(bus.clone(), name)?;
        }

        if let Some(path) = &config.persistence_path {
            bus.load_persisted(path)?;
        }

        let mut handles = HashMap::new();
        let mut workers = Vec::new();
        let mut sims = HashMap::new();
        for bus_config in &config.buses {
            let name = bus_config.name.clone();
            let depth = bus_config.queue_depth;
            let (handle, worker) = match &bus_config.transport {
                TransportConfig::Tcp { address } => BusQueue::spawn(name.clone(), TcpTransport::new(*address), depth),
                #[cfg(feature = "rtu")]
                TransportConfig::Rtu { path, baud_rate } => BusQueue::spawn(
                    name.clone(),
                    crate::rtu::RtuTransport::open(path, *baud_rate)?,
                    depth,
                ),
                #[cfg(not(feature = "rtu"))]
                TransportConfig::Rtu { path, .. } => {
                    return Err(BusError::config(format!(
                        "bus '{}' uses RTU port {}, but RTU support is not compiled in",
                        name, path
                    )));
                }
                TransportConfig::Sim => {
                    let sim = SimTransport::new();
                    sims.insert(name.clone(), sim.clone());
                    BusQueue::spawn(name.clone(), sim, depth)
                }
            };
            handles.insert(name, handle);
            workers.push(worker);
        }

        let mut control = ControlLoop::new(bus.clone(), errors.clone(), config.tick_period());
        for device_config in &config.devices {
            let device = registry.create(&device_config.vendor, &device_config.model, device_config.unit_id)?;
            let limits = device.limits().with_request_timeout(config.request_timeout());
            let mut binding = DeviceBinding::new(device.with_limits(limits));
            for reading in &device_config.readings {
                binding = binding.reading(&reading.parameter, &reading.register);
            }
            for command in &device_config.commands {
                binding = binding.command(&command.register, &command.parameter);
            }
            let handle = handles
                .get(&device_config.bus)
                .cloned()
                .ok_or_else(|| BusError::config(format!("unknown bus '{}'", device_config.bus)))?;
            control.add_device(binding, handle)?;
        }

        info!(
            "Controller initialized: {} registers, {} buses, {} devices",
            bus.len(),
            handles.len(),
            config.devices.len()
        );
        Ok(Self {
            config,
            bus,
            errors,
            control,
            workers,
            sims,
        })
    }

    pub fn bus(&self) -> &Arc<RegisterBus> {
        &self.bus
    }

    pub fn errors(&self) -> &Arc<ErrorAggregator> {
        &self.errors
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Simulated slave behind a `kind: sim` bus.
    pub fn sim(&self, bus: &str) -> Option<&SimTransport> {
        self.sims.get(bus)
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) -> BusResult<()> {
        self.control.add_plugin(plugin)
    }

    pub async fn tick(&mut self) -> TickReport {
        self.control.tick().await
    }

    /// Run the control loop, and the notification endpoint when configured,
    /// until `shutdown` completes. Then tear down.
    pub async fn run<F>(mut self, shutdown: F) -> BusResult<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let webhook = self.spawn_webhook(stop_rx)?;

        self.control.run(shutdown).await;

        let _ = stop_tx.send(true);
        if let Some(task) = webhook {
            match task.await {
                Ok(Err(e)) => warn!("Notification endpoint failed: {}", e),
                Err(e) => warn!("Notification endpoint task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        self.shutdown().await
    }

    #[cfg(feature = "http")]
    fn spawn_webhook(&self, mut stop: watch::Receiver<bool>) -> BusResult<Option<JoinHandle<BusResult<()>>>> {
        let Some(webhook) = &self.config.webhook else {
            return Ok(None);
        };
        let router = crate::webhook::router(self.bus.clone(), Arc::new(webhook.identification_map()));
        let addr = webhook.bind;
        Ok(Some(tokio::spawn(async move {
            crate::webhook::serve(addr, router, async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await
        })))
    }

    #[cfg(not(feature = "http"))]
    fn spawn_webhook(&self, _stop: watch::Receiver<bool>) -> BusResult<Option<JoinHandle<BusResult<()>>>> {
        if self.config.webhook.is_some() {
            return Err(BusError::config("webhook configured, but HTTP support is not compiled in"));
        }
        Ok(None)
    }

    /// Flush persisted registers and stop the bus queues.
    pub async fn shutdown(self) -> BusResult<()> {
        let Self {
            config,
            bus,
            control,
            workers,
            ..
        } = self;

        // Dropping the loop drops the last queue handles
        drop(control);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Bus worker ended abnormally: {}", e);
            }
        }

        if let Some(path) = &config.persistence_path {
            bus.flush_persisted(path)?;
        }
        info!("Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::value::Value;

    const SCHEMA: &str = "\
name,type,scope,default,persisted
relay.k1,bool,internal,,false
relay.k2,bool,internal,,false
relay.outputs,uint16,internal,0,true
";

    fn config(dir: &std::path::Path) -> ControllerConfig {
        std::fs::write(dir.join("registers.csv"), SCHEMA).unwrap();
        let yaml = format!(
            r#"
tick_ms: 20
request_timeout_ms: 10
schema_path: {schema}
persistence_path: {state}
buses:
  - name: lab
    transport: {{ kind: sim }}
devices:
  - bus: lab
    vendor: generic
    model: relay16
    unit_id: 2
    readings:
      - {{ parameter: k1, register: relay.k1 }}
      - {{ parameter: k2, register: relay.k2 }}
    commands:
      - {{ register: relay.outputs, parameter: outputs }}
"#,
            schema = dir.join("registers.csv").display(),
            state = dir.join("state.json").display(),
        );
        ControllerConfig::from_yaml_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_init_tick_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::init(
            config(dir.path()),
            &DeviceRegistry::builtin(),
            Arc::new(ManualClock::default()),
        )
        .await
        .unwrap();

        assert!(controller.bus().by_name("system.errors").is_some());
        let sim = controller.sim("lab").unwrap().clone();
        sim.set_coils(2, 0, &[true; 16]);

        controller.tick().await;
        assert_eq!(controller.bus().get("relay.k1"), Some(Value::Bool(true)));

        controller.bus().set("relay.outputs", 0b1000_0000_0000_0001u16).unwrap();
        let report = controller.tick().await;
        assert_eq!(report.commands_sent, 1);
        assert_eq!(sim.coil(2, 0), Some(true));
        assert_eq!(sim.coil(2, 1), Some(false));
        assert_eq!(sim.coil(2, 15), Some(true));

        controller.shutdown().await.unwrap();
        let state = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(state.contains("\"relay.outputs\": 32769"));
    }

    #[tokio::test]
    async fn test_failed_poll_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::init(
            config(dir.path()),
            &DeviceRegistry::builtin(),
            Arc::new(ManualClock::default()),
        )
        .await
        .unwrap();

        // Unit 2 has no memory mapped yet
        controller.tick().await;
        let published = controller.bus().get("system.errors").unwrap();
        let records: serde_json::Value = serde_json::from_str(published.as_str().unwrap()).unwrap();
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["code"], "NoConnectionWithPLC");
    }

    #[tokio::test]
    async fn test_unsupported_device_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.devices[0].model = "relay64".into();
        let err = Controller::init(config, &DeviceRegistry::builtin(), Arc::new(ManualClock::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::UnsupportedDevice { .. }));
    }
}
