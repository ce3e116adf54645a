use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hotrod_client::core::balancer::BalancingStrategy;
use hotrod_client::core::ServerAddress;
use std::collections::HashSet;

fn servers(count: u16) -> Vec<ServerAddress> {
    (0..count).map(|i| ServerAddress::new("10.0.0.1", 11222 + i)).collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer");

    for strategy in [BalancingStrategy::RoundRobin, BalancingStrategy::Random] {
        let name = format!("{:?}", strategy);
        for failed_count in [0u16, 4, 15] {
            let list = servers(16);
            let failed: HashSet<ServerAddress> = list.iter().take(failed_count as usize).cloned().collect();
            let mut balancer = strategy.create();
            balancer.set_servers(&list);

            group.bench_with_input(BenchmarkId::new(name.clone(), failed_count), &failed, |b, failed| {
                b.iter(|| black_box(balancer.next_server(failed)));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
