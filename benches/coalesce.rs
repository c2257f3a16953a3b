use coalesce::Group;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::future::join_all;

fn execute_overhead(c: &mut Criterion) {
    let mut bench = c.benchmark_group("execute");

    // A lone caller pays the registry round-trip but shares with nobody.
    let flight: Group<u64, u64, String> = Group::new();
    bench.bench_function("solo", |b| {
        b.to_async(tokio::runtime::Runtime::new().expect("build tokio runtime"))
            .iter(|| {
                let flight = flight.clone();
                async move {
                    let result = flight.execute(1, || async { Ok(42) }).await;
                    assert!(result.value.is_ok());
                }
            })
    });

    // N callers racing on one key: one execution, N - 1 joins.
    for waiters in [2usize, 8, 32].iter() {
        let flight: Group<u64, u64, String> = Group::new();
        bench.bench_with_input(BenchmarkId::new("fan-in", waiters), waiters, |b, &waiters| {
            b.to_async(tokio::runtime::Runtime::new().expect("build tokio runtime"))
                .iter(|| {
                    let flight = flight.clone();
                    async move {
                        let callers = (0..waiters).map(|_| {
                            let flight = flight.clone();
                            async move { flight.execute(7, || async { Ok(7) }).await }
                        });
                        let results = join_all(callers).await;
                        assert!(results.iter().all(|r| r.value.is_ok()));
                    }
                })
        });
    }
    bench.finish();
}

criterion_group!(benches, execute_overhead,);
criterion_main!(benches);
