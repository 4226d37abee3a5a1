//! Voltage RegBus Demo
//!
//! Walks through the register bus and the device engine against the built-in
//! simulator:
//! - Codec: typed values to register words and back
//! - Register bus: schema, subscriptions, unchanged writes
//! - Devices: merged read plans, polling through a bus queue, fault isolation
//! - Control loop: readings, an actuator plugin, command write-back
//!
//! Usage: cargo run --bin demo [server_address]
//! Example: cargo run --bin demo 127.0.0.1:502

use std::sync::Arc;
use std::time::Duration;

use voltage_regbus::{
    decode, encode, AccessKind, ActuatorPlugin, ActuatorRegisters, BusQueue, ControlLoop, DataType,
    DeviceBinding, DeviceRegistry, ErrorAggregator, Fault, RegisterBus, SimTransport, SystemClock,
    TcpTransport, Value, WordOrder,
};

const SCHEMA: &str = "\
name,type,scope,default,persisted,description
meter.voltage,float,internal,0,false,Mains voltage
meter.frequency,float,internal,0,false,Mains frequency
meter.energy,uint32,internal,0,true,Energy counter
damper.target,float,external,0,true,Requested damper position
damper.position,float,internal,0,false,Measured damper position
damper.ready,bool,internal,,false,Drive ready
damper.enable,bool,internal,,false,Drive enable
damper.drive,float,internal,0,false,Drive setpoint
damper.state,string,system,idle,false,Actuator state
system.errors,string,system,[],false,Recent errors
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    voltage_regbus::logging::init("warn")?;

    println!("🚀 {}", voltage_regbus::info());
    println!("=============================================\n");

    // =========================================================================
    // Part 1: Codec
    // =========================================================================
    println!("📦 Part 1: Codec");
    println!("----------------");

    let samples = [
        (Value::UInt32(0x12345678), DataType::UInt32),
        (Value::Int16(-500), DataType::Int16),
        (Value::Float(230.4), DataType::Float),
        (Value::from("AHU-1"), DataType::String),
    ];
    for (value, data_type) in &samples {
        for order in [WordOrder::BigEndian, WordOrder::LittleEndian] {
            let words = encode(value, *data_type, order)?;
            let back = decode(&words, *data_type, order)?;
            println!("  {:>10} {:?} {} -> {:04X?} -> {}", value, data_type, order.as_str(), words, back);
        }
    }

    // =========================================================================
    // Part 2: Register Bus
    // =========================================================================
    println!("\n🗂️  Part 2: Register Bus");
    println!("-----------------------");

    let clock = Arc::new(SystemClock);
    let bus = Arc::new(RegisterBus::from_schema(SCHEMA, clock.clone())?);
    println!("  {} registers defined", bus.len());

    bus.subscribe("damper.state", |event| {
        println!("    damper: {} -> {}", event.old, event.new);
        Ok(())
    })?;
    bus.subscribe("meter.voltage", |event| {
        println!("    voltage changed to {} V", event.new);
        Ok(())
    })?;
    println!("  set(meter.voltage, 229.5) changed: {}", bus.set("meter.voltage", 229.5f32)?);
    println!("  set(meter.voltage, 229.5) changed: {}", bus.set("meter.voltage", 229.5f32)?);
    match bus.set_external("meter.voltage", 1.0f32) {
        Ok(_) => println!("  unexpected external write"),
        Err(e) => println!("  set_external rejected: {}", e),
    }

    // =========================================================================
    // Part 3: Devices
    // =========================================================================
    println!("\n🔌 Part 3: Devices on a simulated bus");
    println!("-------------------------------------");

    let sim = SimTransport::new();
    let [hi, lo] = WordOrder::BigEndian.split(231.2f32.to_bits());
    sim.set_input(1, 0, &[hi, lo]);
    sim.set_input(1, 6, &[0x4120, 0x0000]);
    sim.set_input(1, 12, &[0x4500, 0x0000]);
    let [hi, lo] = WordOrder::BigEndian.split(50.0f32.to_bits());
    sim.set_input(1, 70, &[hi, lo]);
    sim.set_holding(1, 342, &[0x5678, 0x0012]);
    sim.set_holding(1, 400, &[0x4D54, 0x2D30, 0x3031, 0x0000]);
    sim.set_holding(1, 500, &[1]);

    let registry = DeviceRegistry::builtin();
    let meter = registry.create("generic", "energy_meter", 1)?;
    for batch in meter.build_read_plan() {
        println!(
            "  plan: {} start={} count={} ({} parameters)",
            batch.access,
            batch.start,
            batch.count,
            batch.members.len()
        );
    }

    let (mut handle, _worker) = BusQueue::spawn("sim-0", sim.clone(), 16);
    let errors = Arc::new(ErrorAggregator::with_default_window(clock.clone()));
    errors.publish_to(bus.clone(), "system.errors")?;

    let snapshot = meter.poll(&mut handle, &errors).await;
    for (name, reading) in snapshot.iter() {
        println!("  {:<14} {:?}", name, reading);
    }

    sim.inject_fault(1, AccessKind::ReadInputRegisters, 70..72, Fault::Timeout);
    let snapshot = meter.poll(&mut handle, &errors).await;
    println!(
        "  with a timeout on 70..72: {} available, unavailable {:?}",
        snapshot.available(),
        snapshot.unavailable()
    );
    sim.clear_faults();
    println!("  queue stats: {:?}", handle.stats());

    // =========================================================================
    // Part 4: Control loop
    // =========================================================================
    println!("\n🎛️  Part 4: Control loop");
    println!("-----------------------");

    let mut control = ControlLoop::new(bus.clone(), errors.clone(), Duration::from_millis(100));
    control.add_device(
        DeviceBinding::new(meter)
            .reading("voltage", "meter.voltage")
            .reading("frequency", "meter.frequency")
            .reading("energy_total", "meter.energy"),
        handle.clone(),
    )?;
    control.add_plugin(Box::new(
        ActuatorPlugin::new(
            "damper",
            ActuatorRegisters {
                target: "damper.target".into(),
                position: "damper.position".into(),
                enable_feedback: "damper.ready".into(),
                enable_command: "damper.enable".into(),
                drive_command: "damper.drive".into(),
                state: Some("damper.state".into()),
            },
            0.5,
        )
        .with_settle_ticks(2),
    ))?;

    bus.set_external("damper.target", 75.0f32)?;
    for tick in 1..=6 {
        // Simulated drive: ready once enabled, jumps to its setpoint
        let enabled = bus.get("damper.enable") == Some(Value::Bool(true));
        bus.set("damper.ready", enabled)?;
        if enabled {
            if let Some(drive) = bus.get("damper.drive") {
                bus.set("damper.position", drive)?;
            }
        }
        let report = control.tick().await;
        println!("  tick {}: {:?}", tick, report);
    }

    println!("\n  Registers:");
    for (name, value) in bus.snapshot() {
        println!("    {:<16} = {}", name, value);
    }

    // =========================================================================
    // Part 5: Modbus TCP (requires a server)
    // =========================================================================
    if let Some(address) = std::env::args().nth(1) {
        println!("\n🌐 Part 5: Modbus TCP {}", address);
        println!("---------------------------------");
        let (mut tcp, _worker) = BusQueue::spawn("tcp-0", TcpTransport::new(address.parse()?), 16);
        let snapshot = registry
            .create("generic", "energy_meter", 1)?
            .poll(&mut tcp, &errors)
            .await;
        for (name, reading) in snapshot.iter() {
            println!("  {:<14} {:?}", name, reading);
        }
    }

    println!("\n  Error window: {}", bus.get("system.errors").map(|v| v.to_string()).unwrap_or_default());
    println!("\n🎉 Demo completed!");
    println!("📚 Documentation: https://docs.rs/voltage_regbus");
    Ok(())
}
