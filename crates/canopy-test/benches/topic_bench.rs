//! Benchmarks for topic matching and interest aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use canopy_core::{matches_any, Topic, TopicPattern, DEFAULT_SEPARATORS};
use canopy_routing::InterestSet;

fn pattern(s: &str) -> TopicPattern {
    TopicPattern::parse(s, DEFAULT_SEPARATORS).unwrap()
}

fn topic(s: &str) -> Topic {
    Topic::parse(s, DEFAULT_SEPARATORS).unwrap()
}

fn bench_topic_parse(c: &mut Criterion) {
    c.bench_function("topic_parse", |b| {
        b.iter(|| Topic::parse(black_box("site/building-4/floor-2/room-17/temp"), DEFAULT_SEPARATORS))
    });
}

fn bench_pattern_match(c: &mut Criterion) {
    let concrete = pattern("site/building-4/floor-2/room-17/temp");
    let single = pattern("site/+/floor-2/+/temp");
    let multi = pattern("site/building-4/#");
    let t = topic("site/building-4/floor-2/room-17/temp");

    let mut group = c.benchmark_group("pattern_match");
    group.bench_function("concrete", |b| b.iter(|| black_box(&concrete).matches(black_box(&t))));
    group.bench_function("single_wildcard", |b| b.iter(|| black_box(&single).matches(black_box(&t))));
    group.bench_function("multi_wildcard", |b| b.iter(|| black_box(&multi).matches(black_box(&t))));
    group.finish();
}

fn bench_matches_any(c: &mut Criterion) {
    let mut group = c.benchmark_group("matches_any");
    let topics = vec![topic("fleet/truck-999/gps"), topic("fleet/truck-999/fuel")];

    for count in [10usize, 100, 1000] {
        // Worst case: only the last pattern matches
        let mut patterns: Vec<TopicPattern> = (0..count - 1)
            .map(|i| pattern(&format!("fleet/truck-{}/+", i)))
            .collect();
        patterns.push(pattern("fleet/+/fuel"));

        group.bench_with_input(BenchmarkId::from_parameter(count), &patterns, |b, patterns| {
            b.iter(|| matches_any(black_box(patterns), black_box(&topics)))
        });
    }
    group.finish();
}

fn bench_interest_insert(c: &mut Criterion) {
    let patterns: Vec<TopicPattern> = (0..256)
        .map(|i| pattern(&format!("region-{}/node-{}/+", i % 16, i)))
        .chain(std::iter::once(pattern("region-3/#")))
        .collect();

    c.bench_function("interest_set_from_patterns_257", |b| {
        b.iter(|| InterestSet::from_patterns(black_box(patterns.iter().cloned())))
    });
}

criterion_group!(
    benches,
    bench_topic_parse,
    bench_pattern_match,
    bench_matches_any,
    bench_interest_insert,
);
criterion_main!(benches);
