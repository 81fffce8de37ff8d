//! The StampDB engine.
//!
//! [`StampDb`] owns every piece of engine state: the segment ring over the
//! device region, the series index with its pending runs, the garbage
//! collector and the snapshot store. All of it is sized from
//! [`Config::workspace_bytes`] at [`StampDb::open`].
//!
//! # Write Path
//!
//! ```text
//! write → pending run (per series) → flush → block encode → page pack
//!       → head page append (rotate + GC when the head segment is full)
//!       → index commit (location + raw latest value)
//! ```

use crate::block::{Block, SeriesId, TimeWindow, Timestamp};
use crate::config::Config;
use crate::device::Device;
use crate::error::{Result, StampError};
use crate::index::{SeriesIndex, Workspace};
use crate::lifecycle::snapshot::{SNAPSHOT_BASE_BYTES, SNAPSHOT_ENTRY_BYTES};
use crate::lifecycle::{recover, GarbageCollector, HeadHint, SnapshotStore};
use crate::log::page::{PageBuilder, PageHeader, MAX_BLOCKS_PER_PAGE};
use crate::log::ring::segment_count_for;
use crate::log::{BlockLocation, SegmentRing};
use crate::query::QueryCursor;
use std::mem::size_of;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine counters reported by [`StampDb::info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Sequence number of the head segment.
    pub seg_seq_head: u32,
    /// Sequence number of the tail segment.
    pub seg_seq_tail: u32,
    /// Blocks written since open.
    pub blocks_written: u64,
    /// Pages that failed their checksum when read.
    pub crc_errors: u32,
    /// Times free space dropped below the low-water mark.
    pub gc_warn_events: u32,
    /// Times GC could not reclaim a segment.
    pub gc_busy_events: u32,
    /// Partial writes erased during recovery.
    pub recovery_truncations: u32,
}

/// A fixed-memory, log-structured time series store.
pub struct StampDb {
    config: Config,
    ring: SegmentRing,
    index: SeriesIndex,
    gc: GarbageCollector,
    store: SnapshotStore,
    builder: PageBuilder,
    block: Block,
    staged: [(usize, u8); MAX_BLOCKS_PER_PAGE],
    staged_len: usize,
    blocks_written: u64,
    blocks_since_hint: u32,
    recovery_truncations: u32,
    closed: bool,
}

impl std::fmt::Debug for StampDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampDb")
            .field("ring", &self.ring)
            .field("series", &self.index.len())
            .field("pending_runs", &self.index.pending_runs())
            .finish_non_exhaustive()
    }
}

impl StampDb {
    /// Opens the engine on `device`, recovering whatever the device holds.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a bad configuration or region geometry, or a
    ///   workspace too small for the region's zone map and the query row
    ///   buffer.
    /// - `Io` if the device fails.
    pub fn open(device: Device, config: Config) -> Result<Self> {
        let segments = segment_count_for(device.region_bytes())?;
        config.validate(segments)?;

        let mut workspace = Workspace::new(config.workspace_bytes);
        let (region, meta) = device.into_parts();
        let mut ring = SegmentRing::new(region, config.sync_mode, &mut workspace)?;
        let row_bytes = config
            .cursor_rows()
            .checked_mul(size_of::<(Timestamp, f32)>())
            .ok_or_else(|| {
                StampError::invalid(format!(
                    "read_batch_rows {} overflows the workspace",
                    config.read_batch_rows
                ))
            })?;
        workspace.reserve("query rows", row_bytes)?;
        workspace.reserve("snapshot header", SNAPSHOT_BASE_BYTES)?;
        let mut index = SeriesIndex::new(&mut workspace, SNAPSHOT_ENTRY_BYTES)?;
        let snapshot_buf =
            Vec::with_capacity(SNAPSHOT_BASE_BYTES + index.capacity() * SNAPSHOT_ENTRY_BYTES);
        let mut store = SnapshotStore::new(meta, config.sync_mode, snapshot_buf);

        let report = recover(&mut ring, &mut index, &mut store)?;
        info!(
            segments,
            series_slots = index.capacity(),
            workspace_used = workspace.used(),
            head = ring.head_seq(),
            tail = ring.tail_seq(),
            "Opened StampDB"
        );

        Ok(Self {
            gc: GarbageCollector::new(config.gc_reserve_segments),
            config,
            ring,
            index,
            store,
            builder: PageBuilder::new(),
            block: Block::default(),
            staged: [(0, 0); MAX_BLOCKS_PER_PAGE],
            staged_len: 0,
            blocks_written: 0,
            blocks_since_hint: 0,
            recovery_truncations: report.truncations,
            closed: false,
        })
    }

    /// Flushes pending samples, saves a snapshot and hands the device back.
    pub fn close(mut self) -> Result<Device> {
        self.flush()?;
        self.snapshot_save()?;
        self.closed = true;
        let region = self.ring.take_region();
        let meta = self.store.take_meta();
        info!("Closed StampDB");
        Ok(Device::from_parts(region, meta))
    }

    /// Buffers one sample.
    ///
    /// The sample becomes durable and visible to queries once its run is
    /// flushed, either explicitly, when the run fills a block, or when the
    /// commit interval elapses. A full run is written on its own; the runs
    /// of other series stay pending.
    ///
    /// An `Ok` return means the sample is buffered. If the flush it triggers
    /// fails, the sample stays pending and is written by a later flush.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a NaN or infinite value.
    /// - `Capacity` if the series is new and no slot is left.
    /// - `Busy`/`NoSpace`/`Io` if the series' run must be written before the
    ///   sample fits and that write fails. The sample is not buffered.
    pub fn write(&mut self, series: SeriesId, ts_ms: Timestamp, value: f32) -> Result<()> {
        if !value.is_finite() {
            return Err(StampError::invalid(format!(
                "value {} for series {} is not finite",
                value, series
            )));
        }
        let slot = self.index.ensure_slot(series)?;
        if !self.index.accepts(slot, ts_ms) {
            self.flush_runs(Some(slot))?;
        }
        self.index.push(slot, ts_ms, value);

        let cut = if self.commit_due() {
            None
        } else if self.index.run_is_full(slot) {
            Some(slot)
        } else {
            return Ok(());
        };
        if let Err(e) = self.flush_runs(cut) {
            warn!(series, ts_ms, error = %e, "Flush after write failed, sample stays pending");
        }
        Ok(())
    }

    fn commit_due(&self) -> bool {
        let interval = self.config.commit_interval_ms;
        interval > 0
            && self
                .index
                .pending_since()
                .is_some_and(|t| t.elapsed() >= Duration::from_millis(u64::from(interval)))
    }

    /// Encodes every pending run and writes it to the log.
    ///
    /// Idempotent: with nothing pending no page is written. Runs are
    /// committed page by page, so on error the runs not yet written stay
    /// pending.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_runs(None)
    }

    /// Writes the pending run of `only`, or of every series when `None`.
    fn flush_runs(&mut self, only: Option<usize>) -> Result<()> {
        let (slots, pending) = match only {
            Some(slot) => (slot..slot + 1, usize::from(!self.index.run(slot).is_empty())),
            None => (0..self.index.len(), self.index.pending_runs()),
        };
        if pending == 0 {
            return Ok(());
        }
        self.builder.reset();
        self.staged_len = 0;

        for slot in slots {
            if self.index.run(slot).is_empty() {
                continue;
            }
            self.index.encode_run(slot, &mut self.block)?;
            if !self.builder.fits(self.block.encoded_len()) {
                self.write_page()?;
            }
            if let Some(offset) = self.builder.push(&self.block) {
                self.staged[self.staged_len] = (slot, offset);
                self.staged_len += 1;
            }
        }
        if !self.builder.is_empty() {
            self.write_page()?;
        }
        debug!(
            runs = pending,
            head = self.ring.head_seq(),
            page = self.ring.head_page(),
            "Flushed pending runs"
        );
        Ok(())
    }

    /// Appends the staged page and commits its runs.
    fn write_page(&mut self) -> Result<()> {
        self.gc.make_room(&mut self.ring, &mut self.index)?;
        let page = self.ring.append(&mut self.builder, PageHeader::data(0))?;
        let seq = self.ring.head_seq();
        for &(slot, offset) in &self.staged[..self.staged_len] {
            self.index
                .commit_run(slot, BlockLocation { seq, page, offset });
        }
        let blocks = self.staged_len as u32;
        self.blocks_written += u64::from(blocks);
        self.staged_len = 0;
        self.builder.reset();

        self.blocks_since_hint += blocks;
        if self.blocks_since_hint >= self.config.hint_interval_blocks {
            self.save_hint()?;
        }
        Ok(())
    }

    fn save_hint(&mut self) -> Result<()> {
        self.store.save_hint(HeadHint {
            seq: self.ring.head_seq(),
            page: self.ring.head_page(),
        })?;
        self.blocks_since_hint = 0;
        Ok(())
    }

    /// Latest committed sample of `series`, exactly as written.
    ///
    /// The raw value survives `close` through the snapshot. When the index
    /// had to be rebuilt from the log (no usable snapshot, or the engine was
    /// dropped without `close`) the value is the block's dequantized one,
    /// which may differ from the written value by up to half a
    /// quantization step.
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing has been committed for the series.
    pub fn query_latest(&self, series: SeriesId) -> Result<(Timestamp, f32)> {
        self.index
            .get(series)
            .and_then(|entry| entry.latest)
            .ok_or(StampError::NotFound(series))
    }

    /// Opens a cursor over committed samples of `series` in `[t0, t1]`.
    ///
    /// A window with `t0 > t1` wraps: it selects `[t0, u32::MAX]` and
    /// `[0, t1]`, which is how a window spanning the timestamp wrap is
    /// expressed.
    pub fn query_begin(&mut self, series: SeriesId, t0: Timestamp, t1: Timestamp) -> Result<QueryCursor> {
        let ordered = self.index.get(series).map_or(true, |e| e.ordered);
        let mut cursor = QueryCursor::new(
            series,
            TimeWindow::new(t0, t1),
            ordered,
            self.config.cursor_rows(),
            self.ring.tail_seq(),
        );
        cursor.fill(&mut self.ring)?;
        Ok(cursor)
    }

    /// Next row of `cursor`, or `None` once it is exhausted.
    pub fn next(&mut self, cursor: &mut QueryCursor) -> Result<Option<(Timestamp, f32)>> {
        cursor.next_row(&mut self.ring)
    }

    /// Releases a cursor.
    pub fn query_end(&mut self, cursor: QueryCursor) {
        drop(cursor);
    }

    /// Iterates the committed samples of `series` in `[t0, t1]`.
    pub fn query(&mut self, series: SeriesId, t0: Timestamp, t1: Timestamp) -> Result<Rows<'_>> {
        let cursor = self.query_begin(series, t0, t1)?;
        Ok(Rows { db: self, cursor })
    }

    /// Persists the series index and head position.
    pub fn snapshot_save(&mut self) -> Result<()> {
        let head = HeadHint {
            seq: self.ring.head_seq(),
            page: self.ring.head_page(),
        };
        self.store
            .save(head, self.ring.tail_seq(), self.index.entries())?;
        self.save_hint()
    }

    /// Current engine counters.
    pub fn info(&self) -> Stats {
        Stats {
            seg_seq_head: self.ring.head_seq(),
            seg_seq_tail: self.ring.tail_seq(),
            blocks_written: self.blocks_written,
            crc_errors: self.ring.crc_errors(),
            gc_warn_events: self.gc.warn_events(),
            gc_busy_events: self.gc.busy_events(),
            recovery_truncations: self.recovery_truncations,
        }
    }

    /// Maximum number of distinct series the workspace can hold.
    pub fn series_capacity(&self) -> usize {
        self.index.capacity()
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for StampDb {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort to commit buffered samples
        if let Err(e) = self.flush() {
            warn!("Failed to flush StampDB on drop: {:?}", e);
        }
    }
}

/// Iterator over query rows, returned by [`StampDb::query`].
#[derive(Debug)]
pub struct Rows<'a> {
    db: &'a mut StampDb,
    cursor: QueryCursor,
}

impl Rows<'_> {
    /// The underlying cursor.
    pub fn cursor(&self) -> &QueryCursor {
        &self.cursor
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<(Timestamp, f32)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.db.next(&mut self.cursor).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::error::Status;
    use crate::log::page::SEGMENT_BYTES;
    use crate::query::CursorState;

    fn config() -> Config {
        Config {
            workspace_bytes: 64 * 1024,
            sync_mode: SyncMode::None,
            ..Config::default()
        }
    }

    fn open(segments: usize) -> StampDb {
        StampDb::open(Device::in_memory(segments * SEGMENT_BYTES), config()).unwrap()
    }

    #[test]
    fn test_write_flush_latest() {
        let mut db = open(8);
        for i in 0..20u32 {
            db.write(1, i * 100, i as f32 * 0.5).unwrap();
        }
        assert_eq!(db.query_latest(1).unwrap_err().status(), Status::NotFound);
        db.flush().unwrap();
        assert_eq!(db.query_latest(1).unwrap(), (1900, 9.5));
        assert_eq!(db.info().blocks_written, 1);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut db = open(8);
        db.write(1, 0, 1.0).unwrap();
        db.flush().unwrap();
        let head = (db.ring.head_seq(), db.ring.head_page());
        db.flush().unwrap();
        db.flush().unwrap();
        assert_eq!((db.ring.head_seq(), db.ring.head_page()), head);
        assert_eq!(db.info().blocks_written, 1);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let mut db = open(8);
        assert_eq!(
            db.write(1, 0, f32::NAN).unwrap_err().status(),
            Status::InvalidArgument
        );
        assert_eq!(
            db.write(1, 0, f32::INFINITY).unwrap_err().status(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn test_rejects_batch_larger_than_workspace() {
        let config = Config {
            workspace_bytes: 8192,
            read_batch_rows: usize::MAX / 4,
            ..config()
        };
        let err = StampDb::open(Device::in_memory(8 * SEGMENT_BYTES), config).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        let config = Config {
            workspace_bytes: 8192,
            read_batch_rows: 8192,
            ..self::config()
        };
        let err = StampDb::open(Device::in_memory(8 * SEGMENT_BYTES), config).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_batch_rows_come_from_workspace() {
        let small = StampDb::open(Device::in_memory(8 * SEGMENT_BYTES), config()).unwrap();
        let large = StampDb::open(
            Device::in_memory(8 * SEGMENT_BYTES),
            Config {
                read_batch_rows: 4096,
                ..config()
            },
        )
        .unwrap();
        assert!(large.series_capacity() < small.series_capacity());
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let err = StampDb::open(Device::in_memory(2 * SEGMENT_BYTES), config()).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        let err = StampDb::open(Device::in_memory(3 * SEGMENT_BYTES + 100), config()).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_full_run_flushes_itself() {
        let mut db = open(8);
        for i in 0..74u32 {
            db.write(3, i, 1.0).unwrap();
        }
        assert_eq!(db.query_latest(3).unwrap(), (73, 1.0));
        assert_eq!(db.index.pending_runs(), 0);
    }

    #[test]
    fn test_full_run_leaves_other_runs_pending() {
        let mut db = open(8);
        db.write(1, 0, 5.0).unwrap();
        for i in 0..74u32 {
            db.write(2, i, 1.0).unwrap();
        }
        assert_eq!(db.query_latest(2).unwrap(), (73, 1.0));
        assert_eq!(db.index.pending_runs(), 1);
        assert_eq!(db.query_latest(1).unwrap_err().status(), Status::NotFound);

        db.flush().unwrap();
        assert_eq!(db.query_latest(1).unwrap(), (0, 5.0));
        assert_eq!(db.info().blocks_written, 2);
    }

    #[test]
    fn test_wrapped_window_query() {
        let mut db = open(8);
        for ts in [u32::MAX - 2, u32::MAX - 1, u32::MAX, 0, 1, 2] {
            db.write(6, ts, 1.0).unwrap();
        }
        db.flush().unwrap();
        assert!(!db.index.get(6).unwrap().ordered);

        let rows: Vec<u32> = db
            .query(6, u32::MAX - 1, 1)
            .unwrap()
            .map(|row| row.unwrap().0)
            .collect();
        assert_eq!(rows, vec![u32::MAX - 1, u32::MAX, 0, 1]);
    }

    #[test]
    fn test_unflushed_rows_are_invisible() {
        let mut db = open(8);
        db.write(1, 10, 1.0).unwrap();
        let mut cursor = db.query_begin(1, 0, 100).unwrap();
        assert_eq!(db.next(&mut cursor).unwrap(), None);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        db.query_end(cursor);
    }

    #[test]
    fn test_commit_interval_flushes_on_write() {
        let mut db = StampDb::open(
            Device::in_memory(8 * SEGMENT_BYTES),
            Config {
                commit_interval_ms: 1,
                ..config()
            },
        )
        .unwrap();
        db.write(1, 0, 1.0).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        db.write(1, 1, 2.0).unwrap();
        assert_eq!(db.query_latest(1).unwrap(), (1, 2.0));
    }

    #[test]
    fn test_series_capacity_limit() {
        let mut db = StampDb::open(
            Device::in_memory(8 * SEGMENT_BYTES),
            Config::with_workspace(8 * 1024),
        )
        .unwrap();
        let capacity = db.series_capacity();
        for series in 0..capacity as u16 {
            db.write(series, 0, 0.0).unwrap();
        }
        let err = db.write(capacity as u16, 0, 0.0).unwrap_err();
        assert_eq!(err.status(), Status::Capacity);
        // Existing series keep accepting writes
        db.write(0, 1, 1.0).unwrap();
    }
}
