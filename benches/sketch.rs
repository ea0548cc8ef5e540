//! Sketch hot-path benchmarks: per-flow updates and heavy-key reversal.

use std::net::Ipv4Addr;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use floodwatch::models::{FlowRecord, PREFIX24_MASK};
use floodwatch::sketch::{BitCount, CountMinSketch, VictimCell};

fn flow(src: u32, dst: u32) -> FlowRecord {
    FlowRecord {
        src: Ipv4Addr::from(src),
        dst: Ipv4Addr::from(dst),
        bytes: 1500,
        packets: 1,
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

fn bench_dst_update(c: &mut Criterion) {
    let mut sketch: CountMinSketch<VictimCell> = CountMinSketch::new(3, 1024, false, true, 1);
    let records: Vec<FlowRecord> = (0..256)
        .map(|i| flow(0xC633_6400 + i, 0x0A00_0000 + (i % 8) * 256 + 1))
        .collect();
    c.bench_function("dst_sketch_update", |b| {
        b.iter(|| {
            for record in &records {
                sketch.update(black_box(record.dst_bits() & PREFIX24_MASK), record);
            }
        })
    });
}

fn bench_src_update(c: &mut Criterion) {
    let mut sketch: CountMinSketch<BitCount> = CountMinSketch::new(3, 32768, false, true, 2);
    let keys: Vec<u32> = (0..256).map(|i| 0xC633_6400 + i * 7919).collect();
    c.bench_function("src_sketch_update", |b| {
        b.iter(|| {
            for &key in &keys {
                sketch.update(black_box(key), &1);
            }
        })
    });
}

fn bench_reversal(c: &mut Criterion) {
    let mut sketch: CountMinSketch<BitCount> = CountMinSketch::new(3, 32768, false, true, 3);
    for i in 0..5000u32 {
        let key = 0x0A00_0000 + i * 257;
        for _ in 0..4 {
            sketch.update(key, &1);
        }
    }
    c.bench_function("reverse_estimate", |b| {
        b.iter(|| {
            let key = black_box(0x0A00_0000 + 1234 * 257);
            let (row, col) = sketch.estimate(key);
            black_box(sketch.cell(row, col).value.reverse_key())
        })
    });
}

criterion_group!(benches, bench_dst_update, bench_src_update, bench_reversal);
criterion_main!(benches);
