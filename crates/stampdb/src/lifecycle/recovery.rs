//! Mount-time recovery.
//!
//! Recovery rebuilds the in-memory view of the log from the region alone,
//! using the snapshot and head hint only to shorten the work:
//!
//! 1. Classify every segment slot by its footer (sealed) or the first valid
//!    page header (open). The live range is the contiguous run of sequence
//!    numbers ending at the highest one found.
//! 2. Finish or discard a relocation group at the front of the head
//!    segment.
//! 3. Scan the head segment forward from the hint for the true head, one
//!    past its last valid page. Corrupt pages before that are skipped; any
//!    bytes after it are erased and counted as a truncation.
//! 4. Seed the series index from the snapshot and replay newer pages, or
//!    rebuild it from every live page when the snapshot does not match the
//!    log. Series that no longer fit the workspace are dropped.

use super::snapshot::{HeadHint, Snapshot, SnapshotStore};
use crate::block::Block;
use crate::device::ERASED;
use crate::error::{Result, StampError};
use crate::index::SeriesIndex;
use crate::log::page::{self, PageBuf, SegmentFooter, DATA_PAGES, PAGES_PER_SEGMENT, PAGE_BYTES};
use crate::log::ring::SegmentState;
use crate::log::{BlockLocation, SegmentRing, SegmentSummary};
use tracing::{debug, info, warn};

/// What recovery found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Partially written data erased past the log head.
    pub truncations: u32,
    /// Index seeded from a snapshot instead of a full scan.
    pub from_snapshot: bool,
    /// Pages scanned into the index.
    pub pages_replayed: u32,
    /// Blocks scanned into the index.
    pub blocks_replayed: u32,
    /// Snapshot entries left out because the index was full.
    pub dropped_entries: u32,
    /// Log blocks left out of the index because it was full.
    pub dropped_blocks: u32,
}

/// Reconstructs `ring` and `index` from the region and metadata.
pub fn recover(
    ring: &mut SegmentRing,
    index: &mut SeriesIndex,
    store: &mut SnapshotStore,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut page_buf: PageBuf = [0; PAGE_BYTES];
    let snapshot = store.load()?;
    let hint = store.load_hint()?;

    let Some(head) = classify(ring, &mut page_buf)? else {
        info!("Empty log, starting fresh");
        if snapshot.is_some() {
            warn!("Snapshot present but log is empty, ignoring it");
        }
        ring.erase_pages(1, 0)?;
        ring.set_summary(1 % ring.segment_count(), SegmentSummary::open(1));
        ring.set_bounds(1, 1, 0);
        store.save_hint(HeadHint { seq: 1, page: 0 })?;
        return Ok(report);
    };

    let tail = live_tail(ring, head);
    ring.set_bounds(tail, head, DATA_PAGES);
    for seq in tail..head {
        summarize_open(ring, seq, &mut page_buf)?;
    }

    let head_state = ring.summary_at(head % ring.segment_count()).state;
    if head_state == SegmentState::Open {
        resolve_relocation(ring, &mut report, &mut page_buf)?;
        find_head(ring, hint, &mut report, &mut page_buf)?;
    }

    let seeded = match &snapshot {
        Some(snapshot) => seed_from_snapshot(ring, index, snapshot, &mut report, &mut page_buf)?,
        None => false,
    };
    if !seeded {
        index.clear();
        report.pages_replayed = 0;
        report.blocks_replayed = 0;
        report.dropped_entries = 0;
        report.dropped_blocks = 0;
        let tail = ring.tail_seq();
        replay(ring, index, (tail, 0), &mut report, &mut page_buf)?;
    }
    report.from_snapshot = seeded;
    if report.dropped_entries > 0 || report.dropped_blocks > 0 {
        warn!(
            capacity = index.capacity(),
            entries = report.dropped_entries,
            blocks = report.dropped_blocks,
            "Series index full during recovery, some series not indexed"
        );
    }

    store.save_hint(HeadHint {
        seq: ring.head_seq(),
        page: ring.head_page(),
    })?;
    info!(
        tail = ring.tail_seq(),
        head = ring.head_seq(),
        head_page = ring.head_page(),
        series = index.len(),
        from_snapshot = seeded,
        pages = report.pages_replayed,
        truncations = report.truncations,
        "Recovery complete"
    );
    Ok(report)
}

/// Fills the zone map from footers and page headers, returning the
/// highest sequence number found.
fn classify(ring: &mut SegmentRing, buf: &mut PageBuf) -> Result<Option<u32>> {
    let count = ring.segment_count();
    let mut head: Option<u32> = None;
    for slot in 0..count {
        ring.read_raw(slot, DATA_PAGES, buf)?;
        let summary = match SegmentFooter::decode(buf) {
            Some(footer) if footer.seg_seq % count == slot && footer.seg_seq > 0 => {
                SegmentSummary::sealed(&footer)
            }
            _ => match unsealed_seq(ring, slot, buf)? {
                Some(seq) => SegmentSummary::open(seq),
                None => SegmentSummary::free(),
            },
        };
        if summary.state != SegmentState::Free {
            head = Some(head.map_or(summary.seq, |h| h.max(summary.seq)));
        }
        ring.set_summary(slot, summary);
    }
    Ok(head)
}

/// Sequence number of an unsealed slot, taken from its first valid page.
///
/// An erased page 0 means the slot is free. A corrupt page 0 does not: the
/// later pages are searched, and if none of them is valid either the
/// corrupt page is counted as a CRC error and the slot treated as free.
fn unsealed_seq(ring: &mut SegmentRing, slot: u32, buf: &mut PageBuf) -> Result<Option<u32>> {
    let count = ring.segment_count();
    for page in 0..DATA_PAGES {
        ring.read_raw(slot, page, buf)?;
        match page::inspect(buf) {
            page::PageStatus::Valid(header)
                if header.seg_seq % count == slot && header.seg_seq > 0 =>
            {
                if page > 0 {
                    warn!(
                        slot,
                        page,
                        seq = header.seg_seq,
                        "First page of segment unreadable, identified by a later page"
                    );
                }
                return Ok(Some(header.seg_seq));
            }
            page::PageStatus::Erased if page == 0 => return Ok(None),
            _ => {}
        }
    }
    warn!(slot, "Segment holds no readable page, treating it as free");
    ring.note_crc_error();
    Ok(None)
}

/// Walks back from `head` while sequence numbers stay contiguous.
fn live_tail(ring: &SegmentRing, head: u32) -> u32 {
    let count = ring.segment_count();
    let mut tail = head;
    while tail > 1 && head - tail + 1 < count {
        let prev = ring.summary_at((tail - 1) % count);
        if prev.state == SegmentState::Free || prev.seq != tail - 1 {
            break;
        }
        tail -= 1;
    }
    debug!(tail, head, "Live segment range");
    tail
}

/// Builds the zone map of an unsealed segment by reading its pages.
fn summarize_open(ring: &mut SegmentRing, seq: u32, buf: &mut PageBuf) -> Result<()> {
    let slot = seq % ring.segment_count();
    if ring.summary_at(slot).state != SegmentState::Open {
        return Ok(());
    }
    ring.set_summary(slot, SegmentSummary::open(seq));
    for page in 0..DATA_PAGES {
        if let Some(header) = ring.read_page(seq, page, buf)? {
            ring.absorb_page(seq, buf, &header);
        }
    }
    Ok(())
}

/// Completes or discards a relocation group at the front of the head.
fn resolve_relocation(
    ring: &mut SegmentRing,
    report: &mut RecoveryReport,
    buf: &mut PageBuf,
) -> Result<()> {
    let head = ring.head_seq();
    let Some(first) = ring.read_page(head, 0, buf)? else {
        return Ok(());
    };
    if !first.is_relocation() {
        return Ok(());
    }
    let source = first.source_seq();
    let total = first.reloc_total;

    let mut complete = total > 0 && total < DATA_PAGES;
    for page in 0..total.min(DATA_PAGES) {
        match ring.read_page(head, page, buf)? {
            Some(h)
                if h.is_relocation()
                    && h.source_seq() == source
                    && h.reloc_total == total
                    && h.reloc_index == page => {}
            _ => {
                complete = false;
                break;
            }
        }
    }

    if complete {
        if source == ring.tail_seq() && source < head {
            info!(source, head, "Completing interrupted segment reclaim");
            ring.release_tail()?;
        }
    } else {
        warn!(source, head, total, "Discarding partial relocation group");
        ring.erase_pages(head, 0)?;
        ring.set_summary(head % ring.segment_count(), SegmentSummary::open(head));
        report.truncations += 1;
    }
    Ok(())
}

/// Locates the head page, one past the last valid page of the head
/// segment, and erases any partial writes after it.
fn find_head(
    ring: &mut SegmentRing,
    hint: Option<HeadHint>,
    report: &mut RecoveryReport,
    buf: &mut PageBuf,
) -> Result<()> {
    let head = ring.head_seq();
    let start = match hint {
        Some(h) if h.seq == head && h.page <= DATA_PAGES => h.page,
        _ => 0,
    };

    ring.set_summary(head % ring.segment_count(), SegmentSummary::open(head));
    for page in 0..start {
        if let Some(header) = ring.read_page(head, page, buf)? {
            ring.absorb_page(head, buf, &header);
        }
    }

    let mut page = start;
    for at in start..DATA_PAGES {
        if let Some(header) = ring.read_page(head, at, buf)? {
            ring.absorb_page(head, buf, &header);
            page = at + 1;
        }
    }
    ring.set_bounds(ring.tail_seq(), head, page);

    let mut dirty = false;
    for rest in page..PAGES_PER_SEGMENT as u8 {
        ring.read_raw(head, rest, buf)?;
        if buf.iter().any(|&b| b != ERASED) {
            dirty = true;
            break;
        }
    }
    if dirty {
        warn!(seq = head, page, "Truncating partially written data at log head");
        ring.erase_pages(head, page)?;
        report.truncations += 1;
    }
    debug!(seq = head, page, hint = ?hint, "Located log head");
    Ok(())
}

/// Seeds the index from `snapshot` and replays the pages written after it.
///
/// Returns false (leaving the index in an unspecified state) if the
/// snapshot does not describe a prefix of the recovered log.
fn seed_from_snapshot(
    ring: &mut SegmentRing,
    index: &mut SeriesIndex,
    snapshot: &Snapshot,
    report: &mut RecoveryReport,
    buf: &mut PageBuf,
) -> Result<bool> {
    let inside = snapshot.head_seq >= ring.tail_seq()
        && (snapshot.head_seq < ring.head_seq()
            || (snapshot.head_seq == ring.head_seq() && snapshot.head_page <= ring.head_page()));
    if !inside {
        info!(
            snapshot_head = snapshot.head_seq,
            snapshot_page = snapshot.head_page,
            "Snapshot does not match log, rebuilding index"
        );
        return Ok(false);
    }

    index.clear();
    for entry in snapshot.entries() {
        match index.restore(entry) {
            Ok(()) => {}
            Err(StampError::Capacity { .. }) => report.dropped_entries += 1,
            Err(e) => return Err(e),
        }
    }
    replay(
        ring,
        index,
        (snapshot.head_seq, snapshot.head_page),
        report,
        buf,
    )?;

    let dangling = index.entries().find(|e| {
        e.location
            .is_some_and(|loc| !ring.is_written(loc.seq, loc.page))
    });
    if let Some(entry) = dangling {
        info!(
            series = entry.series,
            "Snapshot entry points outside the log, rebuilding index"
        );
        return Ok(false);
    }
    debug!(
        generation = snapshot.generation,
        entries = snapshot.len(),
        "Seeded index from snapshot"
    );
    Ok(true)
}

/// Folds every block from `from` up to the head into the index.
fn replay(
    ring: &mut SegmentRing,
    index: &mut SeriesIndex,
    from: (u32, u8),
    report: &mut RecoveryReport,
    buf: &mut PageBuf,
) -> Result<()> {
    let mut block = Block::default();
    let (mut seq, mut page) = from;
    while ring.is_live(seq) {
        if page >= DATA_PAGES {
            seq += 1;
            page = 0;
            continue;
        }
        if !ring.is_written(seq, page) {
            break;
        }
        if let Some(header) = ring.read_page(seq, page, buf)? {
            for (offset, _) in page::blocks(buf, &header) {
                if block.decode_from(page::block_bytes(buf, offset)).is_err() {
                    break;
                }
                let location = BlockLocation { seq, page, offset };
                match index.apply_block(&block, location, header.is_relocation()) {
                    Ok(()) => report.blocks_replayed += 1,
                    Err(StampError::Capacity { .. }) => report.dropped_blocks += 1,
                    Err(e) => return Err(e),
                }
            }
            report.pages_replayed += 1;
        }
        page += 1;
    }
    Ok(())
}
