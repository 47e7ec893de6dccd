use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rgeocoder::kdbush::{KdBush, Point, DEFAULT_NODE_SIZE};

fn pseudo_random_points(n: usize) -> Vec<Point<u32>> {
    // Deterministic LCG so runs are comparable.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as f64 / (1u64 << 31) as f64
    };

    (0..n)
        .map(|i| Point {
            x: next() * 360.0 - 180.0,
            y: next() * 180.0 - 90.0,
            data: i as u32,
        })
        .collect()
}

fn benchmark_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdbush_build");
    for n in [10_000usize, 100_000] {
        let points = pseudo_random_points(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &points, |b, points| {
            b.iter(|| KdBush::new(black_box(points.clone()), DEFAULT_NODE_SIZE));
        });
    }
    group.finish();
}

fn benchmark_within(c: &mut Criterion) {
    let bush = KdBush::new(pseudo_random_points(100_000), DEFAULT_NODE_SIZE);

    c.bench_function("kdbush_within_r0.01", |b| {
        b.iter(|| {
            let mut count = 0u32;
            bush.within(black_box(0.25), black_box(51.5), 0.01, |_| {
                count += 1;
                true
            });
            count
        });
    });
}

criterion_group!(benches, benchmark_build, benchmark_within);
criterion_main!(benches);
