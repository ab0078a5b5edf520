use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use cnxn_factory::expiry::ExpiryWheel;

fn update_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("expiry_wheel_update");

    for &n in &[100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let wheel = ExpiryWheel::new(1_000);
            for i in 0..n as u64 {
                wheel.update(&i, 10_000);
            }

            b.iter(|| {
                for i in 0..n as u64 {
                    wheel.update(&i, 10_000);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, update_churn);
criterion_main!(benches);
