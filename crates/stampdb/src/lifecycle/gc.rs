//! Segment reclamation.
//!
//! Space is reclaimed one segment at a time from the tail. Before the tail
//! is erased, the newest block of every series whose index entry still
//! points into it is copied into a relocation group at the front of the
//! freshly opened head segment, so `query_latest` and the newest history of
//! slow series survive the wrap.
//!
//! Relocation pages carry the group size and the source segment, which lets
//! recovery finish a reclaim that was interrupted after the copy, or discard
//! a group that was only partially written.

use crate::block::Block;
use crate::error::{Result, StampError};
use crate::index::SeriesIndex;
use crate::log::page::{
    self, PageBuf, PageBuilder, PageHeader, BLOCK_AREA_BYTES, DATA_PAGES, MAX_BLOCKS_PER_PAGE,
    PAGE_BYTES,
};
use crate::log::{BlockLocation, SegmentRing};
use tracing::{debug, info, warn};

/// Free-space fraction (in tenths of the log) below which GC warns.
const LOW_WATER_TENTHS: u32 = 1;

/// Rotates the head segment and reclaims the tail.
#[derive(Debug)]
pub struct GarbageCollector {
    reserve: u32,
    warn_events: u32,
    busy_events: u32,
    below_low_water: bool,
    builder: PageBuilder,
    page: PageBuf,
    block: Block,
    staged: [(usize, u8); MAX_BLOCKS_PER_PAGE],
}

impl GarbageCollector {
    /// Creates a collector keeping `reserve` segments free.
    pub fn new(reserve: u32) -> Self {
        Self {
            reserve,
            warn_events: 0,
            busy_events: 0,
            below_low_water: false,
            builder: PageBuilder::new(),
            page: [0; PAGE_BYTES],
            block: Block::default(),
            staged: [(0, 0); MAX_BLOCKS_PER_PAGE],
        }
    }

    /// Times free space dropped below the low-water mark.
    pub fn warn_events(&self) -> u32 {
        self.warn_events
    }

    /// Times reclamation could not make progress.
    pub fn busy_events(&self) -> u32 {
        self.busy_events
    }

    /// Ensures the head segment has a free data page, sealing and rotating
    /// it and reclaiming the tail as needed.
    ///
    /// # Errors
    ///
    /// - `Busy` if the tail's live blocks would not fit in a segment.
    /// - `NoSpace` if the head is full and no segment can be freed.
    pub fn make_room(&mut self, ring: &mut SegmentRing, index: &mut SeriesIndex) -> Result<()> {
        if !ring.head_is_full() {
            return Ok(());
        }
        ring.seal_head()?;

        if ring.free_segments() == 0 {
            // Nowhere to put relocated blocks, so only a tail without live
            // blocks can be dropped.
            if self.live_in_tail(ring, index) > 0 {
                self.busy_events += 1;
                warn!(
                    head = ring.head_seq(),
                    tail = ring.tail_seq(),
                    "Log full and tail still holds live blocks"
                );
                return Err(StampError::NoSpace {
                    segments: ring.in_use(),
                });
            }
            ring.release_tail()?;
        }

        ring.open_next()?;
        if ring.free_segments() < self.reserve {
            self.reclaim_tail(ring, index)?;
        }
        self.check_low_water(ring);
        Ok(())
    }

    fn live_in_tail(&self, ring: &SegmentRing, index: &SeriesIndex) -> usize {
        let tail = ring.tail_seq();
        index
            .entries()
            .filter(|e| e.location.is_some_and(|loc| loc.seq == tail))
            .count()
    }

    fn check_low_water(&mut self, ring: &SegmentRing) {
        let low = ring.free_segments() * 10 < ring.segment_count() * LOW_WATER_TENTHS;
        if low && !self.below_low_water {
            self.warn_events += 1;
            warn!(
                free = ring.free_segments(),
                total = ring.segment_count(),
                "Free log space below low-water mark"
            );
        }
        self.below_low_water = low;
    }

    /// Copies the tail's live blocks to the head and erases the tail.
    ///
    /// Must run right after the head segment was opened, so the relocation
    /// group starts at page 0.
    fn reclaim_tail(&mut self, ring: &mut SegmentRing, index: &mut SeriesIndex) -> Result<()> {
        let source = ring.tail_seq();
        let head = ring.head_seq();
        if source >= head {
            return Ok(());
        }

        let pages = self.plan(ring, index, source)?;
        if pages >= usize::from(DATA_PAGES) {
            self.busy_events += 1;
            warn!(
                source,
                pages, "Live blocks in tail segment exceed one segment, cannot reclaim"
            );
            return Err(StampError::Busy(format!(
                "segment {} holds {} pages of live blocks",
                source, pages
            )));
        }

        let total = pages as u8;
        let mut group_index = 0u8;
        let mut staged = 0usize;
        let mut relocated = 0usize;
        self.builder.reset();

        for slot in 0..index.len() {
            let Some(loc) = index.entry(slot).location.filter(|l| l.seq == source) else {
                continue;
            };
            if !self.load_block(ring, loc)? {
                index.relocate(slot, None);
                continue;
            }
            if !self.builder.fits(self.block.encoded_len()) {
                self.write_group_page(ring, index, source, group_index, total, staged)?;
                group_index += 1;
                staged = 0;
            }
            if let Some(offset) = self.builder.push(&self.block) {
                self.staged[staged] = (slot, offset);
                staged += 1;
                relocated += 1;
            }
        }
        if !self.builder.is_empty() {
            self.write_group_page(ring, index, source, group_index, total, staged)?;
        }

        ring.release_tail()?;
        info!(
            source,
            head, relocated, pages = total, "Reclaimed tail segment"
        );
        Ok(())
    }

    /// Counts the relocation pages needed for `source`, dropping locations
    /// of blocks that can no longer be read.
    fn plan(&mut self, ring: &mut SegmentRing, index: &mut SeriesIndex, source: u32) -> Result<usize> {
        let mut pages = 0usize;
        let mut used = BLOCK_AREA_BYTES;
        let mut blocks = MAX_BLOCKS_PER_PAGE;
        for slot in 0..index.len() {
            let Some(loc) = index.entry(slot).location.filter(|l| l.seq == source) else {
                continue;
            };
            if !self.load_block(ring, loc)? {
                warn!(
                    series = index.entry(slot).series,
                    seq = loc.seq,
                    page = loc.page,
                    "Newest block unreadable, dropping its location"
                );
                index.relocate(slot, None);
                continue;
            }
            let len = self.block.encoded_len();
            if used + len > BLOCK_AREA_BYTES || blocks == MAX_BLOCKS_PER_PAGE {
                pages += 1;
                used = 0;
                blocks = 0;
            }
            used += len;
            blocks += 1;
        }
        Ok(pages)
    }

    fn load_block(&mut self, ring: &mut SegmentRing, loc: BlockLocation) -> Result<bool> {
        if ring.read_page(loc.seq, loc.page, &mut self.page)?.is_none() {
            return Ok(false);
        }
        Ok(self
            .block
            .decode_from(page::block_bytes(&self.page, loc.offset))
            .is_ok())
    }

    fn write_group_page(
        &mut self,
        ring: &mut SegmentRing,
        index: &mut SeriesIndex,
        source: u32,
        group_index: u8,
        total: u8,
        staged: usize,
    ) -> Result<()> {
        let header = PageHeader::relocation(ring.head_seq(), source, group_index, total);
        let page = ring.append(&mut self.builder, header)?;
        for &(slot, offset) in &self.staged[..staged] {
            index.relocate(
                slot,
                Some(BlockLocation {
                    seq: ring.head_seq(),
                    page,
                    offset,
                }),
            );
        }
        debug!(source, page, blocks = staged, "Wrote relocation page");
        self.builder.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::device::MemRegion;
    use crate::index::Workspace;
    use crate::log::page::SEGMENT_BYTES;

    fn setup(segments: usize) -> (SegmentRing, SeriesIndex) {
        let mut workspace = Workspace::new(256 * 1024);
        let ring = SegmentRing::new(
            Box::new(MemRegion::new(segments * SEGMENT_BYTES)),
            SyncMode::None,
            &mut workspace,
        )
        .unwrap();
        let index = SeriesIndex::new(&mut workspace, 0).unwrap();
        (ring, index)
    }

    /// Writes one page holding a block of `n` samples starting at `ts`.
    fn write_block(
        gc: &mut GarbageCollector,
        ring: &mut SegmentRing,
        index: &mut SeriesIndex,
        series: u16,
        ts: u32,
        n: u32,
    ) -> Result<()> {
        gc.make_room(ring, index)?;
        let slot = index.ensure_slot(series)?;
        for t in ts..ts + n {
            index.push(slot, t, t as f32);
        }
        let mut block = Block::default();
        index.encode_run(slot, &mut block)?;
        let mut builder = PageBuilder::new();
        let offset = builder.push(&block).unwrap();
        let page = ring.append(&mut builder, PageHeader::data(0))?;
        index.commit_run(
            slot,
            BlockLocation {
                seq: ring.head_seq(),
                page,
                offset,
            },
        );
        Ok(())
    }

    #[test]
    fn test_wrap_relocates_newest_block() {
        let (mut ring, mut index) = setup(3);
        let mut gc = GarbageCollector::new(1);

        // Series 1 writes once, series 2 keeps the log moving
        write_block(&mut gc, &mut ring, &mut index, 1, 5, 1).unwrap();
        for ts in 0..60 {
            write_block(&mut gc, &mut ring, &mut index, 2, 100 + ts, 1).unwrap();
        }
        assert!(ring.tail_seq() > 1);

        let loc = index.get(1).unwrap().location.unwrap();
        assert!(ring.is_live(loc.seq));
        let mut buf = [0u8; PAGE_BYTES];
        let header = ring.read_page(loc.seq, loc.page, &mut buf).unwrap().unwrap();
        let block = Block::decode(page::block_bytes(&buf, loc.offset)).unwrap();
        assert_eq!(block.series(), 1);
        assert_eq!(block.last_sample(), Some((5, 5.0)));
        assert!(header.is_relocation() || loc.seq == ring.tail_seq());
        assert_eq!(index.get(1).unwrap().latest, Some((5, 5.0)));
        assert_eq!(gc.busy_events(), 0);
    }

    #[test]
    fn test_low_water_warns_once_per_crossing() {
        // With 12 segments a single free segment is below 10%
        let (mut ring, mut index) = setup(12);
        let mut gc = GarbageCollector::new(1);
        for ts in 0..200 {
            write_block(&mut gc, &mut ring, &mut index, 1, ts, 1).unwrap();
        }
        assert!(ring.tail_seq() > 1);
        assert_eq!(gc.warn_events(), 1);
    }

    #[test]
    fn test_busy_when_live_blocks_fill_a_segment() {
        let (mut ring, mut index) = setup(3);
        let mut gc = GarbageCollector::new(1);

        // Every page of segment 1 holds a full-size newest block of a
        // distinct series, too large to share a page
        for series in 0..u16::from(DATA_PAGES) {
            write_block(&mut gc, &mut ring, &mut index, series, 0, 74).unwrap();
        }
        // Fill segment 2 with a single other series
        for ts in 0..u32::from(DATA_PAGES) {
            write_block(&mut gc, &mut ring, &mut index, 100, ts, 1).unwrap();
        }
        // Rotating onto segment 3 leaves no free segment, so the tail must go
        let err = write_block(&mut gc, &mut ring, &mut index, 100, 99, 1).unwrap_err();
        assert!(matches!(err, StampError::Busy(_)));
        assert_eq!(gc.busy_events(), 1);
    }
}
