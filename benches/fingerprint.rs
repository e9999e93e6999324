use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use genproxy::fingerprint::{fingerprint_request, Request};

fn bench_fingerprint_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    for size in [0, 100, 1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let request = Request {
                method: "POST".to_string(),
                host: "api.example.com".to_string(),
                path: "/v1/items?page=2".to_string(),
                body: Some(vec![b'x'; size]),
            };

            b.iter(|| fingerprint_request(black_box(&request)));
        });
    }

    group.finish();
}

fn bench_fingerprint_hex(c: &mut Criterion) {
    let request = Request {
        method: "GET".to_string(),
        host: "example.com".to_string(),
        path: "/a".to_string(),
        body: None,
    };
    let key = fingerprint_request(&request);

    c.bench_function("fingerprint_to_hex", |b| b.iter(|| black_box(&key).to_hex()));
}

criterion_group!(benches, bench_fingerprint_sizes, bench_fingerprint_hex);
criterion_main!(benches);
