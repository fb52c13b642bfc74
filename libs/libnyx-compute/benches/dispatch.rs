//! Dispatch path benchmarks on the host reference driver
//!
//! Run with: cargo bench -p libnyx-compute

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use libnyx_compute::prelude::*;
use std::sync::Arc;

const SOURCE: &str = "__kernel void scale(__global float* a, float k) {}";

fn setup() -> (Arc<HostDriver>, Computer) {
    let driver = Arc::new(HostDriver::new());
    driver.register_kernel("scale", |launch| {
        let k: f32 = launch.scalar(1)?;
        launch.update::<f32>(0, |a| a.iter_mut().for_each(|x| *x *= k))
    });

    let platform = Directory::new(driver.clone()).platform(0).unwrap();
    let computer = Computer::new(0, DeviceKind::Gpu, &platform).unwrap();
    (driver, computer)
}

/// Cached execute: program and kernel already resolved
fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    let (_driver, computer) = setup();

    for len in [256usize, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes((*len * 4) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
            let mut program = Program::from_source(SOURCE);
            let mut kernel = Kernel::new("scale");
            let mut data = Buffer::zeroed::<f32>(len, Access::ReadWrite);
            computer.send(&mut data, ExecMode::Sync).unwrap();

            let mut frame = Frame::new(&mut program, &mut kernel)
                .arg(Arg::buffer(&data))
                .arg(Arg::value(1.0001f32));
            b.iter(|| {
                computer
                    .execute(
                        black_box(&mut frame),
                        &WorkSize::d1(len),
                        &WorkSize::d1(256),
                        ExecMode::Sync,
                    )
                    .unwrap()
            });
        });
    }

    group.finish();
}

/// Send/receive round trip at various sizes
fn bench_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer");
    let (_driver, computer) = setup();

    for len in [1024usize, 65536, 1 << 20].iter() {
        group.throughput(Throughput::Bytes(*len as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
            let mut data = Buffer::zeroed::<u8>(len, Access::ReadWrite);
            b.iter(|| {
                computer.send(black_box(&mut data), ExecMode::Sync).unwrap();
                computer.receive(&data, ExecMode::Sync).unwrap();
            });
        });
    }

    group.finish();
}

/// Lookup cost in a full resource cache
fn bench_cache_lookup(c: &mut Criterion) {
    let (driver, _computer) = setup();
    let platform = Directory::new(driver).platform(0).unwrap();
    let computers: Vec<Computer> = (0..16)
        .map(|_| Computer::new(0, DeviceKind::Gpu, &platform).unwrap())
        .collect();

    let mut program = Program::from_source(SOURCE);
    for computer in &computers {
        program.build(computer).unwrap();
    }

    c.bench_function("program_cache_hit", |b| {
        b.iter(|| program.build(black_box(&computers[15])).unwrap())
    });
}

criterion_group!(benches, bench_execute, bench_transfer, bench_cache_lookup);
criterion_main!(benches);
