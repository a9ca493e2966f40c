//! Query compilation and hydration benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use relgraph_bench::script_paintings;
use relgraph_core::query::{Ordering, Property, SelectQuery, SqlCompiler};
use relgraph_core::SqlConfig;
use relgraph_testkit::{gallery_schema, TestChannel};

/// Benchmark compiling qualifiers of growing path depth.
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let schema = gallery_schema();
    let config = SqlConfig::default();

    for path in ["title", "artist.name", "artist.mentor.name", "artist.paintings.title"] {
        let query = SelectQuery::new("Painting")
            .filter(Property::new(path).eq("Irises").and(Property::new("title").like("I%")))
            .order_by(Ordering::asc(path))
            .limit(50);
        group.bench_with_input(BenchmarkId::from_parameter(path), &query, |b, query| {
            let compiler = SqlCompiler::new(&schema, &config);
            b.iter(|| {
                let compiled = compiler.compile_select(black_box(query)).unwrap();
                black_box(compiled);
            });
        });
    }

    group.finish();
}

/// Benchmark turning result rows into registered objects.
fn bench_hydrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrate");

    for count in [10i64, 100, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let store = TestChannel::new();
            let query = SelectQuery::new("Painting");
            b.iter_batched(
                || {
                    script_paintings(&store, count);
                    store.context()
                },
                |context| {
                    let objects = context.perform_query(&query).unwrap();
                    black_box(objects);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_hydrate);
criterion_main!(benches);
