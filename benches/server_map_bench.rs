use std::sync::LazyLock;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvcluster::{ClusterConfig, ClusterGateway, RealServer, ServerEntry, ServerMap};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

const VIRTUAL_NODE_COUNTS: [u32; 3] = [256, 4096, 65536];

static SHUFFLED_KEYS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let mut keys: Vec<String> = (0..1024).map(|i| format!("user:{}:profile", i)).collect();

    // Use seeded RNG for consistent shuffling across runs
    let mut rng = StdRng::seed_from_u64(1337);
    keys.shuffle(&mut rng);

    keys
});

fn servers(n: usize) -> Vec<RealServer> {
    (0..n)
        .map(|i| RealServer::new(format!("10.0.0.{}", i + 1), 11211, 10 + (i as u32 % 3) * 10))
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for count in VIRTUAL_NODE_COUNTS {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| ServerMap::build(black_box(servers(8)), count).unwrap());
        });
    }
    group.finish();
}

fn bench_remap_add_server(c: &mut Criterion) {
    let mut group = c.benchmark_group("remap_add_server");
    for count in VIRTUAL_NODE_COUNTS {
        let map = ServerMap::build(servers(8), count).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &map, |b, map| {
            b.iter(|| map.remap(black_box(servers(9))).unwrap());
        });
    }
    group.finish();
}

fn bench_route_keys(c: &mut Criterion) {
    let map = ServerMap::build(servers(8), 4096).unwrap();

    c.bench_function("route_keys", |b| {
        b.iter(|| {
            for key in SHUFFLED_KEYS.iter() {
                black_box(map.server_index_for(key));
            }
        });
    });
}

fn bench_gateway_route_cached_map(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        real_servers: (1..=8)
            .map(|i| ServerEntry::new(format!("10.0.0.{}", i), 11211, 10))
            .collect(),
        state_file: dir.path().join("state.db"),
        ..Default::default()
    };
    let gateway = ClusterGateway::new(config).unwrap();

    c.bench_function("gateway_route_cached_map", |b| {
        b.iter(|| {
            for key in SHUFFLED_KEYS.iter() {
                black_box(gateway.server_for(key).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_build,
    bench_remap_add_server,
    bench_route_keys,
    bench_gateway_route_cached_map
);
criterion_main!(benches);
