//! End-to-end tests for the StampDB write, query and reopen paths.

use stampdb::{Config, CursorState, Device, StampDb, Status, SyncMode};
use tempfile::TempDir;

const REGION_BYTES: u64 = 64 * 4096;

fn test_config() -> Config {
    Config {
        sync_mode: SyncMode::None,
        ..Config::default()
    }
}

fn collect(db: &mut StampDb, series: u16, t0: u32, t1: u32) -> Vec<(u32, f32)> {
    db.query(series, t0, t1)
        .unwrap()
        .collect::<stampdb::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn test_write_query_reopen_roundtrip() {
    let temp_dir = TempDir::new().unwrap();

    {
        let device = Device::open_dir(temp_dir.path(), REGION_BYTES).unwrap();
        let mut db = StampDb::open(device, test_config()).unwrap();
        for i in 0..20u32 {
            db.write(1, i * 100, i as f32 * 0.5).unwrap();
        }
        db.flush().unwrap();

        assert_eq!(db.query_latest(1).unwrap(), (1900, 9.5));

        let rows = collect(&mut db, 1, 0, 1900);
        assert_eq!(rows.len(), 20);
        for (i, (ts, value)) in rows.iter().enumerate() {
            let expected = i as f32 * 0.5;
            assert_eq!(*ts, i as u32 * 100, "Timestamp mismatch at row {}", i);
            assert!(
                (value - expected).abs() < 1e-3,
                "Value mismatch at row {}: expected {}, got {}",
                i,
                expected,
                value
            );
        }

        db.close().unwrap();
    }

    assert!(temp_dir.path().join("flash.bin").exists());
    assert!(temp_dir.path().join("meta_head_hint.bin").exists());

    let device = Device::open_dir(temp_dir.path(), REGION_BYTES).unwrap();
    let mut db = StampDb::open(device, test_config()).unwrap();
    assert_eq!(db.query_latest(1).unwrap(), (1900, 9.5));
    assert_eq!(collect(&mut db, 1, 0, 1900).len(), 20);
    assert_eq!(db.info().recovery_truncations, 0);
}

#[test]
fn test_in_memory_device_reopen() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    db.write(7, 1_000, 0.1).unwrap();
    db.write(7, 2_000, 0.2).unwrap();
    let device = db.close().unwrap();

    let mut db = StampDb::open(device, test_config()).unwrap();
    assert_eq!(db.query_latest(7).unwrap(), (2_000, 0.2));
    assert_eq!(collect(&mut db, 7, 0, u32::MAX).len(), 2);
}

#[test]
fn test_latest_requires_commit() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    assert_eq!(db.query_latest(3).unwrap_err().status(), Status::NotFound);

    db.write(3, 10, 1.25).unwrap();
    assert_eq!(db.query_latest(3).unwrap_err().status(), Status::NotFound);

    db.flush().unwrap();
    assert_eq!(db.query_latest(3).unwrap(), (10, 1.25));

    db.write(3, 20, 2.5).unwrap();
    assert_eq!(db.query_latest(3).unwrap(), (10, 1.25));
    db.flush().unwrap();
    assert_eq!(db.query_latest(3).unwrap(), (20, 2.5));
}

#[test]
fn test_flush_idempotent() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    db.write(1, 5, 5.0).unwrap();
    db.flush().unwrap();
    let before = db.info();
    db.flush().unwrap();
    db.flush().unwrap();
    assert_eq!(db.info(), before);
    assert_eq!(collect(&mut db, 1, 0, 10), vec![(5, 5.0)]);
}

#[test]
fn test_query_spans_many_blocks() {
    let config = Config {
        read_batch_rows: 1,
        ..test_config()
    };
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), config).unwrap();
    for i in 0..500u32 {
        db.write(2, i * 10, (i % 50) as f32).unwrap();
    }
    db.flush().unwrap();

    let rows = collect(&mut db, 2, 0, u32::MAX);
    assert_eq!(rows.len(), 500);
    assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(rows[499].0, 4990);
    assert!(db.info().blocks_written >= 7);
}

#[test]
fn test_query_window_and_series_filter() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    for i in 0..100u32 {
        db.write(1, i, 1.0).unwrap();
        db.write(2, i, 2.0).unwrap();
        db.write(300, i, 3.0).unwrap();
    }
    db.flush().unwrap();

    let rows = collect(&mut db, 2, 10, 19);
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|&(ts, v)| (10..=19).contains(&ts) && v == 2.0));

    // Series 300 shares the zone-map bit of series 44
    assert!(collect(&mut db, 44, 0, 100).is_empty());
    assert_eq!(collect(&mut db, 300, 99, 99), vec![(99, 3.0)]);
    assert!(collect(&mut db, 1, 100, 200).is_empty());
}

#[test]
fn test_out_of_order_stored_as_written() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    let written = [(500u32, 1.0f32), (100, 2.0), (300, 3.0), (200, 4.0)];
    for &(ts, v) in &written {
        db.write(9, ts, v).unwrap();
    }
    db.flush().unwrap();

    let rows = collect(&mut db, 9, 0, 1_000);
    let timestamps: Vec<u32> = rows.iter().map(|r| r.0).collect();
    assert_eq!(timestamps, vec![500, 100, 300, 200]);
    for (row, expected) in rows.iter().zip(written.iter()) {
        assert!((row.1 - expected.1).abs() < 1e-3);
    }
    assert_eq!(db.query_latest(9).unwrap(), (200, 4.0));
}

#[test]
fn test_cursor_lifecycle() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    db.write(4, 1, 1.0).unwrap();
    db.write(4, 2, 2.0).unwrap();
    db.flush().unwrap();

    let mut cursor = db.query_begin(4, 0, 10).unwrap();
    assert_eq!(cursor.state(), CursorState::Positioned);
    assert_eq!(cursor.series(), 4);
    assert_eq!(cursor.range(), (0, 10));
    assert_eq!(db.next(&mut cursor).unwrap().map(|r| r.0), Some(1));
    assert_eq!(db.next(&mut cursor).unwrap().map(|r| r.0), Some(2));
    assert_eq!(db.next(&mut cursor).unwrap(), None);
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert_eq!(db.next(&mut cursor).unwrap(), None);
    db.query_end(cursor);
}

#[test]
fn test_cursor_sees_pages_appended_ahead_of_it() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    db.write(1, 1, 1.0).unwrap();
    db.flush().unwrap();

    let mut cursor = db.query_begin(1, 0, 100).unwrap();
    db.write(1, 2, 2.0).unwrap();
    db.flush().unwrap();

    let mut rows = Vec::new();
    while let Some(row) = db.next(&mut cursor).unwrap() {
        rows.push(row.0);
    }
    assert_eq!(rows[0], 1);
    assert!(rows.len() <= 2);
}

#[test]
fn test_drop_flushes_pending() {
    let temp_dir = TempDir::new().unwrap();
    {
        let device = Device::open_dir(temp_dir.path(), REGION_BYTES).unwrap();
        let mut db = StampDb::open(device, test_config()).unwrap();
        db.write(5, 42, 4.2).unwrap();
    }

    let device = Device::open_dir(temp_dir.path(), REGION_BYTES).unwrap();
    let db = StampDb::open(device, test_config()).unwrap();
    let (ts, value) = db.query_latest(5).unwrap();
    assert_eq!(ts, 42);
    assert!((value - 4.2).abs() < 1e-5);
}

#[test]
fn test_query_across_timestamp_wrap() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    let mut ts = u32::MAX - 2;
    for i in 0..6 {
        db.write(8, ts, i as f32).unwrap();
        ts = ts.wrapping_add(1);
    }
    db.flush().unwrap();
    assert_eq!(db.query_latest(8).unwrap(), (2, 5.0));

    let rows: Vec<u32> = db
        .query(8, u32::MAX - 1, 1)
        .unwrap()
        .map(|row| row.unwrap().0)
        .collect();
    assert_eq!(rows, vec![u32::MAX - 1, u32::MAX, 0, 1]);

    let rows: Vec<u32> = db
        .query(8, 0, 10)
        .unwrap()
        .map(|row| row.unwrap().0)
        .collect();
    assert_eq!(rows, vec![0, 1, 2]);
}

#[test]
fn test_invalid_arguments() {
    let mut db = StampDb::open(Device::in_memory(REGION_BYTES as usize), test_config()).unwrap();
    assert_eq!(
        db.write(1, 0, f32::NAN).unwrap_err().status(),
        Status::InvalidArgument
    );

    let bad = Config {
        read_batch_rows: 0,
        ..test_config()
    };
    let err = StampDb::open(Device::in_memory(REGION_BYTES as usize), bad).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);

    let err = StampDb::open(Device::in_memory(8192), test_config()).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);
}
