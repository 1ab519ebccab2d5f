//! 분할 / 페이싱 마이크로 벤치마크
//!
//! Run with: `cargo bench --bench partition`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use widepath::{partition, Pacer, RemainderPlacement};

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    for channels in [1usize, 4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(channels), &channels, |b, &n| {
            b.iter(|| partition(black_box(64 * 1024 * 1024 + 3), n, RemainderPlacement::Trailing))
        });
    }
    group.finish();
}

fn bench_pacer_reserve(c: &mut Criterion) {
    let unlimited = Pacer::unlimited();
    c.bench_function("pacer_reserve_unlimited", |b| {
        b.iter(|| unlimited.reserve(black_box(8 * 1024)))
    });

    // 충분히 높은 상한에서 예약 비용만 측정
    let limited = Pacer::new(1e15, Duration::from_millis(5));
    c.bench_function("pacer_reserve_limited", |b| {
        b.iter(|| limited.reserve(black_box(8 * 1024)))
    });
}

criterion_group!(benches, bench_partition, bench_pacer_reserve);
criterion_main!(benches);
