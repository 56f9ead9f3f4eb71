// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use criterion::{criterion_group, criterion_main, Criterion};
use horizondb_storage::block;
use horizondb_storage::field::{Field, Record, TimeUnit};
use horizondb_storage::CompressionType;
use std::collections::HashMap;

fn records(n: usize) -> Vec<Record> {
    (0..n as i64)
        .map(|ts| Record::new(0, vec![Field::Timestamp(TimeUnit::Millis, ts), Field::Integer(ts)]))
        .collect()
}

fn encode(c: &mut Criterion) {
    let records = records(1_000);

    c.bench_function("block encode 1000 records", |b| {
        b.iter(|| {
            let mut last = HashMap::new();
            block::encode(&records, &mut last, CompressionType::None)
        });
    });
}

fn decode(c: &mut Criterion) {
    let records = records(1_000);
    let mut last = HashMap::new();
    let encoded = block::encode(&records, &mut last, CompressionType::None);

    c.bench_function("block decode 1000 records", |b| {
        b.iter(|| {
            let mut last = HashMap::new();
            let decoded: Result<Vec<_>, _> = block::decode(&encoded, &mut last).unwrap().collect();
            decoded.unwrap()
        });
    });
}

criterion_group!(benches, encode, decode);
criterion_main!(benches);
