//! Benchmarks for the edge proxy's hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use edgeproxy::config::RingConfig;
use edgeproxy::handler::HttpRequestHead;
use edgeproxy::hashring::{HashRing, ServiceInstance};
use edgeproxy::registry::{ServiceDescriptor, ServicePort, ServiceRegistry};
use edgeproxy::router::{RouteRule, RouteTable, UriMatch};

fn instances(count: usize) -> Vec<ServiceInstance> {
    (0..count)
        .map(|i| ServiceInstance::new("default", "web", format!("10.1.0.{i}")))
        .collect()
}

fn bench_hash_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_ring");
    group.throughput(Throughput::Elements(1));

    for size in [4usize, 16, 64] {
        let ring = HashRing::with_members(RingConfig::default(), instances(size));
        group.bench_function(format!("locate_{size}_members"), |b| {
            let mut i = 0u64;
            b.iter(|| {
                i = i.wrapping_add(1);
                black_box(ring.locate(format!("session-{i}").as_bytes()).unwrap());
            });
        });
    }

    group.bench_function("add_then_remove_member", |b| {
        let ring = HashRing::with_members(RingConfig::default(), instances(16));
        let extra = ServiceInstance::new("default", "web", "10.1.0.200");
        let key = extra.to_string();
        b.iter(|| {
            ring.add(extra.clone());
            ring.remove(&key);
        });
    });

    group.finish();
}

fn bench_registry_resolve(c: &mut Criterion) {
    let registry = ServiceRegistry::new();
    for i in 0..100u16 {
        registry.upsert(ServiceDescriptor::new(
            format!("default.svc-{i}"),
            format!("10.0.0.{i}"),
            vec![
                ServicePort::new("tcp", 80, 8080),
                ServicePort::new("http", 8000, 9000),
            ],
        ));
    }

    c.bench_function("registry_resolve", |b| {
        b.iter(|| {
            black_box(registry.resolve("10.0.0.42", 8000));
        });
    });
}

fn bench_route_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_table");

    let table = RouteTable::new(
        "default",
        vec![
            RouteRule::new(vec![UriMatch::exact("/api/users")], "default.users"),
            RouteRule::new(vec![UriMatch::prefix("/api/")], "default.api"),
            RouteRule::new(vec![UriMatch::regex(r"^/v[0-9]+/.*")], "default.versioned"),
        ],
    );

    group.bench_function("route_exact_match", |b| {
        b.iter(|| {
            black_box(table.route("/api/users"));
        });
    });

    group.bench_function("route_prefix_match", |b| {
        b.iter(|| {
            black_box(table.route("/api/products/123"));
        });
    });

    group.bench_function("route_regex_match", |b| {
        b.iter(|| {
            black_box(table.route("/v2/resource/abc"));
        });
    });

    group.bench_function("route_no_match", |b| {
        b.iter(|| {
            black_box(table.route("/unknown/path"));
        });
    });

    group.finish();
}

fn bench_request_parsing(c: &mut Criterion) {
    let raw = b"GET /v1/users/42 HTTP/1.1\r\nHost: web.default\r\nX-User: alice\r\nAccept: */*\r\nUser-Agent: bench\r\n\r\n";

    c.bench_function("parse_request_head", |b| {
        b.iter(|| {
            black_box(HttpRequestHead::parse(raw).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_hash_ring,
    bench_registry_resolve,
    bench_route_table,
    bench_request_parsing,
);

criterion_main!(benches);
