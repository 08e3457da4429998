//! Benchmarks for wheel placement math and the submission path.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wheel_timer::{placement, Timeout, TimerConfig, WheelTimer};

const OPS_PER_ITER: u64 = 10_000;

fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    for wheel_len in [64u64, 512, 4096] {
        group.bench_with_input(
            BenchmarkId::from_parameter(wheel_len),
            &wheel_len,
            |b, &wheel_len| {
                let tick_duration = 1_000_000i64;
                b.iter(|| {
                    let mut acc = 0u64;
                    for i in 0..OPS_PER_ITER as i64 {
                        let deadline = i * 37_000_000 % 900_000_000_000;
                        let (rounds, slot) = placement(
                            black_box(deadline),
                            tick_duration,
                            black_box(i % 1024),
                            wheel_len,
                        );
                        acc = acc.wrapping_add(rounds as u64 ^ slot);
                    }
                    acc
                })
            },
        );
    }

    group.finish();
}

fn bench_schedule_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_cancel");
    group.throughput(Throughput::Elements(OPS_PER_ITER));
    // Live worker in the background; keep criterion's sample count sane.
    group.sample_size(10);

    group.bench_function("submit_then_cancel", |b| {
        let timer = WheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            ..TimerConfig::default()
        })
        .unwrap();

        b.iter(|| {
            for _ in 0..OPS_PER_ITER {
                let timeout = timer
                    .new_timeout(|_: &Arc<Timeout>| {}, Duration::from_secs(600))
                    .unwrap();
                black_box(timeout.cancel());
            }
        });

        timer.stop().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_placement, bench_schedule_cancel);
criterion_main!(benches);
