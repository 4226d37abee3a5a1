//! Codec, read-plan and register-bus throughput benchmarks

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use voltage_regbus::{
    build_read_plan, decode, encode, AccessKind, DataType, Device, DeviceLimits, ErrorAggregator,
    ManualClock, Parameter, RegisterBus, RegisterDef, SimTransport, Value, WordOrder,
};

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let words = WordOrder::LittleEndian.split(0x4148_0000);

    group.bench_function("decode_float_le", |b| {
        b.iter(|| decode(black_box(&words), DataType::Float, WordOrder::LittleEndian).unwrap())
    });
    group.bench_function("encode_int32_be", |b| {
        b.iter(|| encode(black_box(&Value::Int32(-123_456)), DataType::Int32, WordOrder::BigEndian).unwrap())
    });
    group.finish();
}

fn parameters(count: u16) -> Vec<Parameter> {
    (0..count)
        .map(|i| {
            Parameter::scalar(format!("p{}", i), AccessKind::ReadHoldingRegisters, DataType::Float, i * 2)
                .unwrap()
        })
        .collect()
}

fn benchmark_read_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_plan");
    let limits = DeviceLimits::default();

    for count in [10u16, 100, 1000].iter() {
        let params = parameters(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &params, |b, params| {
            b.iter(|| build_read_plan(black_box(params), &limits))
        });
    }
    group.finish();
}

fn benchmark_register_bus(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_bus");
    let bus = RegisterBus::with_clock(Arc::new(ManualClock::default()));
    for i in 0..1000 {
        bus.define(RegisterDef::new(format!("zone{}.temp", i), DataType::Float))
            .unwrap();
    }
    bus.subscribe("zone0.temp", |_| Ok(())).unwrap();

    let mut n = 0u32;
    group.bench_function("set_changed", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            bus.set("zone0.temp", Value::Float(n as f32)).unwrap()
        })
    });
    group.bench_function("set_unchanged", |b| {
        b.iter(|| bus.set("zone1.temp", Value::Float(0.0)).unwrap())
    });
    group.bench_function("get", |b| b.iter(|| bus.get(black_box("zone500.temp"))));
    group.finish();
}

fn benchmark_poll(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("device_poll");

    for count in [10u16, 60].iter() {
        let mut device = Device::new("bench", "meter", 1);
        for p in parameters(*count) {
            device.add_parameter(p).unwrap();
        }
        let sim = SimTransport::new();
        sim.set_holding(1, 0, &vec![0u16; usize::from(*count) * 2]);
        let errors = ErrorAggregator::with_default_window(Arc::new(ManualClock::default()));

        group.bench_with_input(BenchmarkId::from_parameter(count), &device, |b, device| {
            b.iter(|| {
                rt.block_on(async {
                    let mut sim = sim.clone();
                    device.poll(&mut sim, &errors).await
                })
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_codec,
    benchmark_read_plan,
    benchmark_register_bus,
    benchmark_poll
);
criterion_main!(benches);
