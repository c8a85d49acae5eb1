use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opsync_clock::{merge_and_increment, VectorClock};
use opsync_types::ClientId;
use std::collections::BTreeSet;

fn wide_clock(prefix: &str, n: u64) -> VectorClock {
    VectorClock::from_entries((0..n).map(|i| (format!("{prefix}-{i}"), i + 1)))
}

fn bench_compare(c: &mut Criterion) {
    let a = wide_clock("c", 50);
    let b = wide_clock("c", 50).incremented(&ClientId::from("c-3"));
    c.bench_function("compare 50x50", |bench| {
        bench.iter(|| black_box(&a).compare(black_box(&b)))
    });
}

fn bench_merge_and_increment(c: &mut Criterion) {
    let clocks: Vec<VectorClock> = (0..8).map(|i| wide_clock(&format!("p{i}"), 20)).collect();
    let me = ClientId::from("me");
    c.bench_function("merge_and_increment 8x20", |bench| {
        bench.iter(|| merge_and_increment(black_box(&clocks).iter(), &me))
    });
}

fn bench_limit_size(c: &mut Criterion) {
    let clock = wide_clock("c", 200);
    let me = ClientId::from("c-0");
    let protected: BTreeSet<ClientId> = [ClientId::from("c-1")].into_iter().collect();
    c.bench_function("limit_size 200 -> 50", |bench| {
        bench.iter(|| black_box(&clock).limit_size(&me, &protected, 50))
    });
}

criterion_group!(benches, bench_compare, bench_merge_and_increment, bench_limit_size);
criterion_main!(benches);
