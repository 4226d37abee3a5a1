//! Register bus behaviour under concurrency, with schema and persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use proptest::prelude::*;
use voltage_regbus::{
    decode, encode, BusError, DataType, ManualClock, RegisterBus, RegisterDef, Scope, Value, WordOrder,
};

fn bus() -> RegisterBus {
    RegisterBus::with_clock(Arc::new(ManualClock::default()))
}

#[test]
fn test_set_then_get_and_unchanged_write() {
    let bus = bus();
    bus.define(RegisterDef::new("zone.temp", DataType::Float)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    bus.subscribe("zone.temp", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    assert!(bus.set("zone.temp", 21.5f32).unwrap());
    assert_eq!(bus.get("zone.temp"), Some(Value::Float(21.5)));
    let stamp = bus.last_updated("zone.temp");

    assert!(!bus.set("zone.temp", 21.5f32).unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(bus.last_updated("zone.temp"), stamp);
}

#[test]
fn test_concurrent_writers_one_register() {
    let bus = Arc::new(bus());
    bus.define(RegisterDef::new("shared.value", DataType::Int32)).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe("shared.value", move |event| {
        sink.lock().push((event.old.clone(), event.new.clone()));
        Ok(())
    })
    .unwrap();

    let writers = 8;
    let per_writer = 200;
    let transitions = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let bus = bus.clone();
            let transitions = transitions.clone();
            thread::spawn(move || {
                for i in 0..per_writer {
                    let value = (w * per_writer + i + 1) as i32;
                    if bus.set("shared.value", value).unwrap() {
                        transitions.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let events = events.lock();
    assert_eq!(events.len(), transitions.load(Ordering::SeqCst));

    // Handlers observed a single chain of transitions in landing order
    let mut previous = Value::Int32(0);
    for (old, new) in events.iter() {
        assert_eq!(old, &previous);
        previous = new.clone();
    }
    assert_eq!(bus.get("shared.value"), Some(previous.clone()));

    let Value::Int32(last) = previous else {
        panic!("unexpected type");
    };
    assert!((1..=(writers * per_writer) as i32).contains(&last));
}

#[test]
fn test_writers_on_distinct_registers() {
    let bus = Arc::new(bus());
    for i in 0..16 {
        bus.define(RegisterDef::new(format!("zone{}.temp", i), DataType::UInt16))
            .unwrap();
    }
    let handles: Vec<_> = (0..16u16)
        .map(|i| {
            let bus = bus.clone();
            thread::spawn(move || {
                for v in 1..=100u16 {
                    bus.set(&format!("zone{}.temp", i), v * (i + 1)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    for i in 0..16u16 {
        assert_eq!(bus.get(&format!("zone{}.temp", i)), Some(Value::UInt16(100 * (i + 1))));
    }
}

#[test]
fn test_failing_subscriber_is_isolated() {
    let bus = bus();
    bus.define(RegisterDef::new("door.open", DataType::Bool)).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));

    bus.subscribe("door.open", |_| Err("alarm panel offline".into())).unwrap();
    bus.subscribe("door.open", |_| panic!("broken handler")).unwrap();
    let counter = seen.clone();
    bus.subscribe("door.open", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    assert!(bus.set("door.open", true).unwrap());
    assert!(bus.set("door.open", false).unwrap());
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_on_change_replaces_subscribers() {
    let bus = bus();
    bus.define(RegisterDef::new("fan.on", DataType::Bool)).unwrap();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let c = first.clone();
    bus.on_change("fan.on", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    let c = second.clone();
    bus.on_change("fan.on", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    bus.set("fan.on", true).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn test_schema_and_persistence_restart() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("registers.csv");
    let state = dir.path().join("state.json");
    std::fs::write(
        &schema,
        "\
# controller registers
name,type,scope,default,persisted,description
heating.setpoint,float,external,20,true,Comfort setpoint
heating.mode,string,internal,auto,true,
heating.flow_temp,float,internal,0,false,
",
    )
    .unwrap();

    let clock = Arc::new(ManualClock::default());
    let first = RegisterBus::from_schema_path(&schema, clock.clone()).unwrap();
    assert_eq!(first.by_name("heating.setpoint").unwrap().scope(), Scope::External);
    first.set_external("heating.setpoint", 22.5f32).unwrap();
    first.set("heating.mode", "eco").unwrap();
    first.set("heating.flow_temp", 45.0f32).unwrap();
    assert_eq!(first.flush_persisted(&state).unwrap(), 2);

    let second = RegisterBus::from_schema_path(&schema, clock).unwrap();
    assert_eq!(second.load_persisted(&state).unwrap(), 2);
    assert_eq!(second.get("heating.setpoint"), Some(Value::Float(22.5)));
    assert_eq!(second.get("heating.mode"), Some(Value::from("eco")));
    assert_eq!(second.get("heating.flow_temp"), Some(Value::Float(0.0)));
}

#[test]
fn test_type_conflicts_and_unknown_names() {
    let bus = bus();
    bus.define(RegisterDef::new("a.b", DataType::UInt16)).unwrap();
    assert!(bus.define(RegisterDef::new("a.b", DataType::UInt16)).is_ok());
    assert!(matches!(
        bus.define(RegisterDef::new("a.b", DataType::Float)).unwrap_err(),
        BusError::RegisterTypeConflict { .. }
    ));
    assert!(matches!(
        bus.set("a.c", 1u16).unwrap_err(),
        BusError::UnknownRegister { .. }
    ));
    assert!(matches!(
        bus.set("a.b", "text").unwrap_err(),
        BusError::BadRegisterDataType { .. }
    ));
    assert!(matches!(
        bus.subset(&["a.b", "a.missing"]).unwrap_err(),
        BusError::UnknownRegister { .. }
    ));
}

fn value_of(data_type: DataType) -> BoxedStrategy<Value> {
    match data_type {
        DataType::Bool => any::<bool>().prop_map(Value::Bool).boxed(),
        DataType::Int16 => any::<i16>().prop_map(Value::Int16).boxed(),
        DataType::UInt16 => any::<u16>().prop_map(Value::UInt16).boxed(),
        DataType::Int32 => any::<i32>().prop_map(Value::Int32).boxed(),
        DataType::UInt32 => any::<u32>().prop_map(Value::UInt32).boxed(),
        DataType::Float => any::<f32>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::Float)
            .boxed(),
        DataType::String => "[ -~]{1,16}".prop_map(Value::String).boxed(),
    }
}

fn typed_value() -> impl Strategy<Value = (DataType, Value)> {
    prop_oneof![
        Just(DataType::Bool),
        Just(DataType::Int16),
        Just(DataType::UInt16),
        Just(DataType::Int32),
        Just(DataType::UInt32),
        Just(DataType::Float),
        Just(DataType::String),
    ]
    .prop_flat_map(|t| value_of(t).prop_map(move |v| (t, v)))
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(
        (data_type, value) in typed_value(),
        little in any::<bool>(),
    ) {
        let order = if little { WordOrder::LittleEndian } else { WordOrder::BigEndian };
        let words = encode(&value, data_type, order).unwrap();
        prop_assert_eq!(decode(&words, data_type, order).unwrap(), value);
    }
}
