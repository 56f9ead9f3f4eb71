// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use horizondb_storage::binary_search::partition_point;

fn hand_rolled(c: &mut Criterion) {
    let items: Vec<i64> = (0..10_000).collect();

    c.bench_function("partition_point hand-rolled", |b| {
        b.iter(|| partition_point(&items, |&x| x < black_box(6_789)));
    });
}

fn std_partition_point(c: &mut Criterion) {
    let items: Vec<i64> = (0..10_000).collect();

    c.bench_function("partition_point std", |b| {
        b.iter(|| items.partition_point(|&x| x < black_box(6_789)));
    });
}

criterion_group!(benches, hand_rolled, std_partition_point);
criterion_main!(benches);
