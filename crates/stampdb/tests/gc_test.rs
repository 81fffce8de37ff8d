//! Log wrap-around and reclamation through the public engine API.

use stampdb::{Config, Device, StampDb, Status, SyncMode};

const SEGMENT_BYTES: usize = 4096;

fn small_db(segments: usize) -> StampDb {
    let config = Config {
        sync_mode: SyncMode::None,
        ..Config::default()
    };
    StampDb::open(Device::in_memory(segments * SEGMENT_BYTES), config).unwrap()
}

#[test]
fn test_wrap_keeps_latest_of_quiet_series() {
    let mut db = small_db(4);
    db.write(1, 5, 42.125).unwrap();
    db.flush().unwrap();

    // One page per flush pushes the log around the ring several times
    for i in 0..200u32 {
        db.write(2, 1_000 + i, i as f32).unwrap();
        db.flush().unwrap();
    }

    let stats = db.info();
    assert!(stats.seg_seq_tail > 1, "tail never advanced: {:?}", stats);
    assert!(stats.seg_seq_head - stats.seg_seq_tail < 4);
    assert_eq!(stats.gc_busy_events, 0);

    assert_eq!(db.query_latest(1).unwrap(), (5, 42.125));
    let rows: Vec<(u32, f32)> = db
        .query(1, 0, 10)
        .unwrap()
        .collect::<stampdb::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows, vec![(5, 42.125)]);
    assert_eq!(db.query_latest(2).unwrap(), (1_199, 199.0));

    // Old history of the busy series has been reclaimed
    let oldest = db
        .query(2, 0, u32::MAX)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert!(oldest.0 > 1_000);

    let device = db.close().unwrap();
    let config = Config {
        sync_mode: SyncMode::None,
        ..Config::default()
    };
    let db = StampDb::open(device, config).unwrap();
    assert_eq!(db.query_latest(1).unwrap(), (5, 42.125));
    assert_eq!(db.query_latest(2).unwrap(), (1_199, 199.0));
    assert_eq!(db.info().recovery_truncations, 0);
}

#[test]
fn test_wrap_recovers_without_snapshot() {
    let mut db = small_db(3);
    db.write(10, 1, 7.0).unwrap();
    db.flush().unwrap();
    for i in 0..100u32 {
        db.write(11, i, 1.0).unwrap();
        db.flush().unwrap();
    }
    let head = db.info().seg_seq_head;
    let mut device = db.close().unwrap();
    for file in [
        stampdb::MetaFile::SnapshotA,
        stampdb::MetaFile::SnapshotB,
        stampdb::MetaFile::HeadHint,
    ] {
        device
            .meta_mut()
            .store(file, &[], SyncMode::None)
            .unwrap();
    }

    let config = Config {
        sync_mode: SyncMode::None,
        ..Config::default()
    };
    let db = StampDb::open(device, config).unwrap();
    assert_eq!(db.info().seg_seq_head, head);
    assert_eq!(db.query_latest(10).unwrap(), (1, 7.0));
    assert_eq!(db.query_latest(11).unwrap(), (99, 1.0));
}

#[test]
fn test_busy_when_tail_is_all_live() {
    let mut db = small_db(3);

    // Fifteen series each own a full-size block, one per page of segment 1
    for series in 0..15u16 {
        for ts in 0..74u32 {
            db.write(series, ts, ts as f32).unwrap();
        }
    }
    assert_eq!(db.info().blocks_written, 15);

    // Segment 2 is filled by a single series
    for ts in 0..15u32 {
        db.write(100, ts, 1.0).unwrap();
        db.flush().unwrap();
    }
    assert_eq!(db.info().seg_seq_head, 2);

    // Opening segment 3 leaves no room to relocate segment 1
    db.write(100, 99, 2.0).unwrap();
    let err = db.flush().unwrap_err();
    assert_eq!(err.status(), Status::Busy);
    assert_eq!(db.info().gc_busy_events, 1);
    assert_eq!(db.query_latest(100).unwrap(), (14, 1.0));

    // The pending run survives and lands once retried
    db.flush().unwrap();
    assert_eq!(db.query_latest(100).unwrap(), (99, 2.0));
    for series in 0..15u16 {
        assert_eq!(db.query_latest(series).unwrap(), (73, 73.0));
    }
}

#[test]
fn test_write_accepted_when_triggered_flush_is_busy() {
    let mut db = small_db(3);
    for series in 0..15u16 {
        for ts in 0..74u32 {
            db.write(series, ts, ts as f32).unwrap();
        }
    }
    for ts in 0..15u32 {
        db.write(100, ts, 1.0).unwrap();
        db.flush().unwrap();
    }

    // The last sample fills the run; the flush it triggers hits Busy
    for ts in 100..174u32 {
        db.write(100, ts, 3.0).unwrap();
    }
    assert_eq!(db.info().gc_busy_events, 1);
    assert_eq!(db.query_latest(100).unwrap(), (14, 1.0));

    db.flush().unwrap();
    assert_eq!(db.query_latest(100).unwrap(), (173, 3.0));
    let rows: Vec<(u32, f32)> = db
        .query(100, 173, 173)
        .unwrap()
        .collect::<stampdb::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(rows, vec![(173, 3.0)]);
    let run: Vec<(u32, f32)> = db
        .query(100, 100, 173)
        .unwrap()
        .collect::<stampdb::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(run.len(), 74);
}
