//! Benchmarks for StampDB components.
//!
//! Run with: cargo bench --package stampdb
//!
//! ## Benchmark Categories
//!
//! - **Block Codec**: Encode/decode of full blocks
//! - **Write Path**: Buffered writes plus flush to the log
//! - **Query**: Range scans over many blocks
//! - **Recovery**: Reopen with and without a snapshot

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stampdb::block::MAX_BLOCK_SAMPLES;
use stampdb::{Block, Config, Device, MetaFile, StampDb, SyncMode};

const REGION_BYTES: usize = 256 * 4096;

fn bench_config() -> Config {
    Config {
        sync_mode: SyncMode::None,
        ..Config::default()
    }
}

/// Generate a sensor-like run (100 ms cadence, slowly varying values).
fn generate_run(count: usize) -> Vec<(u32, f32)> {
    let mut value = 20.0f32;
    (0..count)
        .map(|i| {
            value += ((i as f32) * 0.1).sin() * 0.05;
            (i as u32 * 100, value)
        })
        .collect()
}

/// Open an in-memory engine holding `samples` rows of each of `series`.
fn populated_db(series: u16, samples: u32) -> StampDb {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES), bench_config()).unwrap();
    for i in 0..samples {
        for s in 0..series {
            db.write(s, i * 100, (i % 100) as f32 * 0.5).unwrap();
        }
    }
    db.flush().unwrap();
    db
}

fn bench_block_encode(c: &mut Criterion) {
    let samples = generate_run(MAX_BLOCK_SAMPLES);

    c.bench_function("block_encode_full", |b| {
        b.iter(|| Block::encode(1, black_box(&samples)).unwrap())
    });
}

fn bench_block_decode(c: &mut Criterion) {
    let samples = generate_run(MAX_BLOCK_SAMPLES);
    let block = Block::encode(1, &samples).unwrap();
    let mut buf = vec![0u8; block.encoded_len()];
    block.write_to(&mut buf);
    let mut scratch = Block::default();

    c.bench_function("block_decode_full", |b| {
        b.iter(|| {
            scratch.decode_from(black_box(&buf)).unwrap();
            scratch.samples().fold(0.0f32, |acc, (_, v)| acc + v)
        })
    });
}

fn bench_write_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_flush");

    for series in [1u16, 8, 64].iter() {
        let points = 1_000u32;
        group.throughput(Throughput::Elements(u64::from(points) * u64::from(*series)));
        group.bench_with_input(BenchmarkId::from_parameter(series), series, |b, &series| {
            b.iter_batched(
                || StampDb::open(Device::in_memory(REGION_BYTES), bench_config()).unwrap(),
                |mut db| {
                    for i in 0..points {
                        for s in 0..series {
                            db.write(s, i * 100, i as f32).unwrap();
                        }
                    }
                    db.flush().unwrap();
                    db
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_query_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_scan");
    let mut db = populated_db(4, 2_000);

    group.throughput(Throughput::Elements(2_000));
    group.bench_function("full_series", |b| {
        b.iter(|| {
            db.query(black_box(2), 0, u32::MAX)
                .unwrap()
                .map(|row| row.unwrap().1)
                .sum::<f32>()
        })
    });

    group.bench_function("narrow_window", |b| {
        b.iter(|| {
            db.query(black_box(2), 100_000, 110_000)
                .unwrap()
                .filter_map(|row| row.ok())
                .count()
        })
    });

    group.bench_function("latest", |b| b.iter(|| db.query_latest(black_box(3)).unwrap()));

    group.finish();
}

fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");

    for with_snapshot in [true, false] {
        let name = if with_snapshot { "snapshot" } else { "full_scan" };
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let mut device = populated_db(16, 1_000).close().unwrap();
                    if !with_snapshot {
                        for file in [MetaFile::SnapshotA, MetaFile::SnapshotB, MetaFile::HeadHint] {
                            device.meta_mut().store(file, &[], SyncMode::None).unwrap();
                        }
                    }
                    device
                },
                |device| StampDb::open(device, bench_config()).unwrap(),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    // Block codec
    bench_block_encode,
    bench_block_decode,
    // Write path
    bench_write_flush,
    // Query
    bench_query_scan,
    // Recovery
    bench_recovery,
);
criterion_main!(benches);
