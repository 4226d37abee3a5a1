//! Persistence of `persisted=true` registers as a flat JSON object.
//!
//! ```json
//! { "hvac.setpoint": 21.5, "relay.k1": true }
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};
use crate::register::RegisterBus;
use crate::value::Value;

impl RegisterBus {
    /// Write every persisted register to `path`.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so a crash leaves either the old or the new content. Returns the
    /// number of registers written.
    pub fn flush_persisted(&self, path: impl AsRef<Path>) -> BusResult<usize> {
        let path = path.as_ref();
        let registers = self.persisted();
        let object: serde_json::Map<String, serde_json::Value> = registers
            .iter()
            .map(|r| (r.name().to_string(), r.value().to_json()))
            .collect();

        let tmp = temp_path(path);
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, &object)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        info!("Flushed {} persisted registers to {}", object.len(), path.display());
        Ok(object.len())
    }

    /// Restore persisted registers from `path`, overriding schema defaults.
    ///
    /// A missing file is not an error. Unknown names, registers not marked
    /// persisted and values of the wrong type are logged and skipped. No
    /// change handler fires. Returns the number of registers restored.
    pub fn load_persisted(&self, path: impl AsRef<Path>) -> BusResult<usize> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No persistence file at {}", path.display());
            return Ok(0);
        }

        let text = fs::read_to_string(path)?;
        let object = match serde_json::from_str::<serde_json::Value>(&text)? {
            serde_json::Value::Object(object) => object,
            other => {
                return Err(BusError::config(format!(
                    "{}: expected a JSON object, found {}",
                    path.display(),
                    json_kind(&other)
                )));
            }
        };

        let now = self.clock().now();
        let mut restored = 0;
        for (name, json) in object {
            let Some(register) = self.by_name(&name) else {
                warn!("Skipping persisted value for unknown register {}", name);
                continue;
            };
            if !register.is_persisted() {
                warn!("Skipping {}: register is not marked persisted", name);
                continue;
            }
            match Value::from_json(&json, register.data_type()).and_then(|v| register.restore(v, now)) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Skipping persisted value for {}: {}", name, e),
            }
        }

        info!("Restored {} persisted registers from {}", restored, path.display());
        Ok(restored)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "registers".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::register::RegisterDef;
    use crate::value::DataType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bus() -> RegisterBus {
        let bus = RegisterBus::with_clock(Arc::new(ManualClock::default()));
        bus.define_all([
            RegisterDef::new("hvac.setpoint", DataType::Float)
                .with_default(21.5f32)
                .persisted(true),
            RegisterDef::new("relay.k1", DataType::Bool).persisted(true),
            RegisterDef::new("hvac.supply_temp", DataType::Float),
        ])
        .unwrap();
        bus
    }

    #[test]
    fn test_flush_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let first = bus();
        first.set("hvac.setpoint", 19.0f32).unwrap();
        first.set("relay.k1", true).unwrap();
        first.set("hvac.supply_temp", 30.0f32).unwrap();
        assert_eq!(first.flush_persisted(&path).unwrap(), 2);
        assert!(!dir.path().join(".state.json.tmp").exists());

        let second = bus();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        second
            .subscribe("relay.k1", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(second.load_persisted(&path).unwrap(), 2);
        assert_eq!(second.get("hvac.setpoint"), Some(Value::Float(19.0)));
        assert_eq!(second.get("relay.k1"), Some(Value::Bool(true)));
        assert_eq!(second.get("hvac.supply_temp"), Some(Value::Float(0.0)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_non_finite_floats_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let bus = || {
            let bus = RegisterBus::with_clock(Arc::new(ManualClock::default()));
            bus.define_all([
                RegisterDef::new("meter.ratio", DataType::Float).persisted(true),
                RegisterDef::new("meter.peak", DataType::Float).persisted(true),
            ])
            .unwrap();
            bus
        };

        let first = bus();
        first.set("meter.ratio", f32::NAN).unwrap();
        first.set("meter.peak", f32::NEG_INFINITY).unwrap();
        assert_eq!(first.flush_persisted(&path).unwrap(), 2);

        let second = bus();
        assert_eq!(second.load_persisted(&path).unwrap(), 2);
        assert_eq!(second.get("meter.ratio"), Some(Value::Float(f32::NAN)));
        assert_eq!(second.get("meter.peak"), Some(Value::Float(f32::NEG_INFINITY)));
    }

    #[test]
    fn test_load_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"hvac.setpoint": "warm", "relay.k1": 1, "gone.away": 3, "hvac.supply_temp": 40}"#,
        )
        .unwrap();

        let bus = bus();
        assert_eq!(bus.load_persisted(&path).unwrap(), 1);
        assert_eq!(bus.get("hvac.setpoint"), Some(Value::Float(21.5)));
        assert_eq!(bus.get("relay.k1"), Some(Value::Bool(true)));
        assert_eq!(bus.get("hvac.supply_temp"), Some(Value::Float(0.0)));
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus();
        assert_eq!(bus.load_persisted(dir.path().join("none.json")).unwrap(), 0);

        let path = dir.path().join("array.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(bus.load_persisted(&path).unwrap_err(), BusError::Config { .. }));

        std::fs::write(&path, "{oops").unwrap();
        assert!(matches!(bus.load_persisted(&path).unwrap_err(), BusError::Json(_)));
    }
}
