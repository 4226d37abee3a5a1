//! # Register Schema
//!
//! CSV source the register bus is built from at startup:
//!
//! ```text
//! # name, type, scope, default, persisted, description
//! name,type,scope,default,persisted,description
//! hvac.supply_temp,float,internal,0,false,Supply air temperature
//! hvac.setpoint,float,external,21.5,true,
//! ```
//!
//! The header row is optional and detected by its first column. Lines starting
//! with `#` are comments. Any malformed row aborts loading with
//! [`BusError::Schema`] carrying the 1-based line number.

use std::collections::HashSet;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::info;

use crate::clock::SharedClock;
use crate::error::{BusError, BusResult};
use crate::register::{validate_name, RegisterBus, RegisterDef, Scope};
use crate::value::{DataType, Value};

/// Parse schema text into register definitions, in file order.
pub fn parse_schema(text: &str) -> BusResult<Vec<RegisterDef>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut defs = Vec::new();
    let mut seen = HashSet::new();
    let mut first = true;

    for record in reader.records() {
        let record = record.map_err(|e| BusError::Schema {
            line: e.position().map(|p| p.line()).unwrap_or(0),
            message: e.to_string(),
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.iter().all(str::is_empty) {
            continue;
        }
        if std::mem::take(&mut first) && is_header(&record) {
            continue;
        }

        let def = parse_row(&record).map_err(|message| BusError::Schema { line, message })?;
        if !seen.insert(def.name.clone()) {
            return Err(BusError::Schema {
                line,
                message: format!("duplicate register name '{}'", def.name),
            });
        }
        defs.push(def);
    }
    Ok(defs)
}

/// Read and parse a schema file.
pub fn load_schema(path: impl AsRef<Path>) -> BusResult<Vec<RegisterDef>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let defs = parse_schema(&text)?;
    info!("Loaded {} register definitions from {}", defs.len(), path.display());
    Ok(defs)
}

impl RegisterBus {
    /// Build a bus from schema text.
    pub fn from_schema(text: &str, clock: SharedClock) -> BusResult<Self> {
        let bus = Self::with_clock(clock);
        bus.define_all(parse_schema(text)?)?;
        Ok(bus)
    }

    /// Build a bus from a schema file.
    pub fn from_schema_path(path: impl AsRef<Path>, clock: SharedClock) -> BusResult<Self> {
        let bus = Self::with_clock(clock);
        bus.define_all(load_schema(path)?)?;
        Ok(bus)
    }
}

fn is_header(record: &StringRecord) -> bool {
    record
        .get(0)
        .is_some_and(|field| field.eq_ignore_ascii_case("name"))
}

fn parse_row(record: &StringRecord) -> Result<RegisterDef, String> {
    if record.len() < 5 {
        return Err(format!("expected at least 5 columns, found {}", record.len()));
    }
    let field = |i: usize| record.get(i).unwrap_or_default();

    let name = field(0);
    validate_name(name).map_err(|e| e.to_string())?;
    let data_type: DataType = field(1).parse().map_err(|e: BusError| e.to_string())?;
    let scope: Scope = field(2).parse().map_err(|e: BusError| e.to_string())?;
    let persisted = parse_flag(field(4))?;

    let mut def = RegisterDef::new(name, data_type)
        .with_scope(scope)
        .persisted(persisted);

    let default = field(3);
    if !default.is_empty() {
        let value = Value::parse(data_type, default)
            .map_err(|_| format!("default '{}' is not a valid {}", default, data_type))?;
        def = def.with_default(value);
    }

    let description = record.iter().skip(5).collect::<Vec<_>>().join(",");
    if !description.is_empty() {
        def = def.with_description(description);
    }
    Ok(def)
}

fn parse_flag(text: &str) -> Result<bool, String> {
    match text.to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "n" => Ok(false),
        "1" | "true" | "yes" | "y" => Ok(true),
        other => Err(format!("persisted flag '{}' is not a boolean", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const SCHEMA: &str = "\
# building A
name,type,scope,default,persisted,description
hvac.supply_temp,float,internal,0,false,Supply air temperature
hvac.setpoint,float,external,21.5,true,
relay.k1,bool,system,,no,Relay 1, west wall
system.errors,string,system,,false
";

    #[test]
    fn test_parse_schema() {
        let defs = parse_schema(SCHEMA).unwrap();
        assert_eq!(defs.len(), 4);

        assert_eq!(defs[0].name, "hvac.supply_temp");
        assert_eq!(defs[0].data_type, DataType::Float);
        assert_eq!(defs[0].description.as_deref(), Some("Supply air temperature"));

        assert_eq!(defs[1].scope, Scope::External);
        assert_eq!(defs[1].default, Some(Value::Float(21.5)));
        assert!(defs[1].persisted);
        assert_eq!(defs[1].description, None);

        assert_eq!(defs[2].default, None);
        assert_eq!(defs[2].description.as_deref(), Some("Relay 1,west wall"));
        assert_eq!(defs[3].data_type, DataType::String);
    }

    #[test]
    fn test_schema_without_header() {
        let defs = parse_schema("a.b,uint16,internal,7,false\n").unwrap();
        assert_eq!(defs[0].default, Some(Value::UInt16(7)));
    }

    #[test]
    fn test_schema_errors_carry_line() {
        let cases = [
            ("name,type,scope,default,persisted\nx,decimal,internal,,false\n", 2),
            ("x,float,public,,false\n", 1),
            ("x,uint16,internal,-1,false\n", 1),
            ("x,bool,internal,,maybe\n", 1),
            ("x..y,bool,internal,,false\n", 1),
            ("x,bool,internal\n", 1),
            ("x,bool,internal,,false\n# again\nx,bool,internal,,false\n", 3),
        ];
        for (text, expected) in cases {
            match parse_schema(text).unwrap_err() {
                BusError::Schema { line, .. } => assert_eq!(line, expected, "{}", text),
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_bus_from_schema() {
        let bus = RegisterBus::from_schema(SCHEMA, Arc::new(ManualClock::default())).unwrap();
        assert_eq!(bus.len(), 4);
        assert_eq!(bus.get("hvac.setpoint"), Some(Value::Float(21.5)));
        assert_eq!(bus.get("relay.k1"), Some(Value::Bool(false)));
        assert_eq!(bus.by_name("relay.k1").unwrap().scope(), Scope::System);
    }

    #[test]
    fn test_load_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registers.csv");
        std::fs::write(&path, SCHEMA).unwrap();
        let bus = RegisterBus::from_schema_path(&path, Arc::new(ManualClock::default())).unwrap();
        assert_eq!(bus.names()[0], "hvac.setpoint");

        assert!(matches!(
            load_schema(dir.path().join("missing.csv")).unwrap_err(),
            BusError::Io(_)
        ));
    }
}
