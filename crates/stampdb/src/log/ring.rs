//! The segment ring: a circular log of fixed-size segments over a region.
//!
//! Segments are identified by a monotonically increasing sequence number;
//! segment `seq` lives at slot `seq % segment_count`. The live range is
//! `tail_seq..=head_seq`. Pages are appended only at the head and are never
//! rewritten; space is reclaimed a whole segment at a time from the tail.

use super::page::{
    self, PageBuf, PageBuilder, PageHeader, PageStatus, SegmentFooter, SeriesFilter, DATA_PAGES,
    PAGES_PER_SEGMENT, PAGE_BYTES, SEGMENT_BYTES,
};
use crate::block::{Block, SeriesId, TimeWindow, Timestamp};
use crate::config::SyncMode;
use crate::device::{MemRegion, Region, ERASED};
use crate::error::{Result, StampError};
use crate::index::Workspace;
use tracing::{debug, warn};

/// Minimum number of segments a region must hold.
pub const MIN_SEGMENTS: u32 = 3;

/// Returns the number of segments in a region of `bytes`, validating its
/// geometry.
pub fn segment_count_for(bytes: u64) -> Result<u32> {
    if bytes % SEGMENT_BYTES as u64 != 0 {
        return Err(StampError::invalid(format!(
            "region size {} is not a multiple of {}",
            bytes, SEGMENT_BYTES
        )));
    }
    let count = bytes / SEGMENT_BYTES as u64;
    if count < u64::from(MIN_SEGMENTS) || count > u64::from(u32::MAX) {
        return Err(StampError::invalid(format!(
            "region holds {} segments, need at least {}",
            count, MIN_SEGMENTS
        )));
    }
    Ok(count as u32)
}

/// Lifecycle state of a segment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Erased or holding data outside the live range.
    Free,
    /// Accepting (or was accepting) pages, no footer yet.
    Open,
    /// Footer written.
    Sealed,
}

/// In-memory zone map entry for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Sequence number of the segment occupying the slot.
    pub seq: u32,
    /// Slot state.
    pub state: SegmentState,
    /// Blocks stored so far.
    pub block_count: u32,
    /// Earliest timestamp of any block.
    pub t_min: Timestamp,
    /// Latest timestamp of any block.
    pub t_max: Timestamp,
    /// Series present.
    pub filter: SeriesFilter,
}

impl SegmentSummary {
    /// A free slot.
    pub fn free() -> Self {
        Self {
            seq: 0,
            state: SegmentState::Free,
            block_count: 0,
            t_min: Timestamp::MAX,
            t_max: Timestamp::MIN,
            filter: SeriesFilter::default(),
        }
    }

    /// A freshly opened, empty segment.
    pub fn open(seq: u32) -> Self {
        Self {
            seq,
            state: SegmentState::Open,
            ..Self::free()
        }
    }

    /// Builds a summary from a sealed segment's footer.
    pub fn sealed(footer: &SegmentFooter) -> Self {
        Self {
            seq: footer.seg_seq,
            state: SegmentState::Sealed,
            block_count: footer.block_count,
            t_min: footer.t_min,
            t_max: footer.t_max,
            filter: footer.filter,
        }
    }

    /// Accounts for one block.
    pub fn record(&mut self, series: SeriesId, t_lo: Timestamp, t_hi: Timestamp) {
        self.block_count += 1;
        self.t_min = self.t_min.min(t_lo);
        self.t_max = self.t_max.max(t_hi);
        self.filter.insert(series);
    }

    /// False only if no block of `series` within `window` can be here.
    pub fn may_contain(&self, series: SeriesId, window: TimeWindow) -> bool {
        self.block_count > 0
            && self.filter.may_contain(series)
            && window.overlaps(self.t_min, self.t_max)
    }

    fn footer(&self) -> SegmentFooter {
        SegmentFooter {
            seg_seq: self.seq,
            block_count: self.block_count,
            t_min: self.t_min,
            t_max: self.t_max,
            filter: self.filter,
        }
    }
}

/// Physical location of a block in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    /// Sequence number of the segment.
    pub seq: u32,
    /// Data page within the segment.
    pub page: u8,
    /// Byte offset within the page's block area.
    pub offset: u8,
}

impl BlockLocation {
    /// Slot index of the segment in a ring of `segment_count` segments.
    pub fn segment_index(&self, segment_count: u32) -> u32 {
        self.seq % segment_count
    }
}

/// The circular segment log.
pub struct SegmentRing {
    region: Box<dyn Region>,
    sync_mode: SyncMode,
    summaries: Vec<SegmentSummary>,
    segment_count: u32,
    head_seq: u32,
    head_page: u8,
    tail_seq: u32,
    crc_errors: u32,
    scratch: Block,
}

impl std::fmt::Debug for SegmentRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentRing")
            .field("segment_count", &self.segment_count)
            .field("head_seq", &self.head_seq)
            .field("head_page", &self.head_page)
            .field("tail_seq", &self.tail_seq)
            .finish_non_exhaustive()
    }
}

impl SegmentRing {
    /// Wraps `region`, carving the zone map out of `workspace`.
    ///
    /// The ring starts empty with head and tail at sequence 1; recovery
    /// repositions it with [`SegmentRing::set_bounds`].
    pub fn new(
        region: Box<dyn Region>,
        sync_mode: SyncMode,
        workspace: &mut Workspace,
    ) -> Result<Self> {
        let segment_count = segment_count_for(region.size())?;
        let summaries = workspace.carve(
            "segment zone map",
            segment_count as usize,
            SegmentSummary::free(),
        )?;
        Ok(Self {
            region,
            sync_mode,
            summaries,
            segment_count,
            head_seq: 1,
            head_page: 0,
            tail_seq: 1,
            crc_errors: 0,
            scratch: Block::default(),
        })
    }

    /// Detaches the underlying region, leaving the ring unusable.
    pub fn take_region(&mut self) -> Box<dyn Region> {
        std::mem::replace(&mut self.region, Box::new(MemRegion::new(0)))
    }

    /// Total segments in the ring.
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// Sequence number of the head (newest) segment.
    pub fn head_seq(&self) -> u32 {
        self.head_seq
    }

    /// Next page to be written in the head segment.
    pub fn head_page(&self) -> u8 {
        self.head_page
    }

    /// Sequence number of the tail (oldest live) segment.
    pub fn tail_seq(&self) -> u32 {
        self.tail_seq
    }

    /// Segments in the live range.
    pub fn in_use(&self) -> u32 {
        self.head_seq - self.tail_seq + 1
    }

    /// Segments outside the live range.
    pub fn free_segments(&self) -> u32 {
        self.segment_count - self.in_use()
    }

    /// True when no data page is left in the head segment.
    pub fn head_is_full(&self) -> bool {
        self.head_page >= DATA_PAGES
    }

    /// True if `seq` is inside the live range.
    pub fn is_live(&self, seq: u32) -> bool {
        seq >= self.tail_seq && seq <= self.head_seq
    }

    /// True if `(seq, page)` has been written and is still live.
    pub fn is_written(&self, seq: u32, page: u8) -> bool {
        self.is_live(seq) && (seq < self.head_seq || page < self.head_page)
    }

    /// CRC failures observed while reading pages.
    pub fn crc_errors(&self) -> u32 {
        self.crc_errors
    }

    /// Counts a page found corrupt outside [`SegmentRing::read_page`].
    pub(crate) fn note_crc_error(&mut self) {
        self.crc_errors += 1;
    }

    /// Zone map entry for a live segment.
    pub fn summary(&self, seq: u32) -> Option<&SegmentSummary> {
        if !self.is_live(seq) {
            return None;
        }
        Some(&self.summaries[self.slot(seq)])
    }

    /// Zone map entry of the slot at `index`, whatever it holds.
    pub(crate) fn summary_at(&self, index: u32) -> &SegmentSummary {
        &self.summaries[index as usize]
    }

    pub(crate) fn set_summary(&mut self, index: u32, summary: SegmentSummary) {
        self.summaries[index as usize] = summary;
    }

    /// Repositions the ring after recovery.
    pub(crate) fn set_bounds(&mut self, tail_seq: u32, head_seq: u32, head_page: u8) {
        self.tail_seq = tail_seq;
        self.head_seq = head_seq;
        self.head_page = head_page;
    }

    fn slot(&self, seq: u32) -> usize {
        (seq % self.segment_count) as usize
    }

    fn page_offset(&self, seq: u32, page: u8) -> u64 {
        self.slot(seq) as u64 * SEGMENT_BYTES as u64 + u64::from(page) * PAGE_BYTES as u64
    }

    /// Reads a page image without validating it.
    pub fn read_raw(&mut self, seq: u32, page: u8, buf: &mut PageBuf) -> Result<()> {
        let offset = self.page_offset(seq, page);
        self.region.read_at(offset, buf)?;
        Ok(())
    }

    /// Reads and validates a data page.
    ///
    /// Returns `None` for erased pages, pages belonging to another segment
    /// generation, and corrupt pages. Corrupt pages are counted as CRC
    /// errors.
    pub fn read_page(&mut self, seq: u32, page: u8, buf: &mut PageBuf) -> Result<Option<PageHeader>> {
        self.read_raw(seq, page, buf)?;
        match page::inspect(buf) {
            PageStatus::Valid(header) if header.seg_seq == seq => Ok(Some(header)),
            PageStatus::Valid(_) | PageStatus::Erased => Ok(None),
            PageStatus::Corrupt { expected, actual } => {
                self.crc_errors += 1;
                warn!(
                    seq,
                    page,
                    expected = format_args!("{:#010x}", expected),
                    actual = format_args!("{:#010x}", actual),
                    "Page checksum mismatch"
                );
                Ok(None)
            }
        }
    }

    /// Writes a finished page at the head and advances the head position.
    ///
    /// `header.seg_seq` is overwritten with the head sequence.
    pub fn append(&mut self, builder: &mut PageBuilder, mut header: PageHeader) -> Result<u8> {
        if self.head_is_full() {
            return Err(StampError::NoSpace {
                segments: self.in_use(),
            });
        }
        header.seg_seq = self.head_seq;
        header.block_count = builder.block_count();
        let page = self.head_page;
        let offset = self.page_offset(self.head_seq, page);
        let image = *builder.finish(header);
        self.region.write_at(offset, &image)?;
        self.region.sync(self.sync_mode)?;
        self.head_page += 1;

        self.absorb_page(self.head_seq, &image, &header);
        Ok(page)
    }

    /// Adds the blocks of a valid page to the zone map of segment `seq`.
    pub(crate) fn absorb_page(&mut self, seq: u32, image: &PageBuf, header: &PageHeader) {
        let slot = self.slot(seq);
        for (at, _) in page::blocks(image, header) {
            if self.scratch.decode_from(page::block_bytes(image, at)).is_err() {
                break;
            }
            let (lo, hi) = self.scratch.time_bounds();
            self.summaries[slot].record(self.scratch.series(), lo, hi);
        }
    }

    /// Writes the head segment's footer.
    pub fn seal_head(&mut self) -> Result<()> {
        let slot = self.slot(self.head_seq);
        if self.summaries[slot].state == SegmentState::Sealed {
            return Ok(());
        }
        let footer = self.summaries[slot].footer().encode();
        let offset = self.page_offset(self.head_seq, DATA_PAGES);
        self.region.write_at(offset, &footer)?;
        self.region.sync(self.sync_mode)?;
        self.summaries[slot].state = SegmentState::Sealed;
        self.head_page = DATA_PAGES;
        debug!(
            seq = self.head_seq,
            blocks = self.summaries[slot].block_count,
            "Sealed segment"
        );
        Ok(())
    }

    /// Erases the next slot and makes it the head segment.
    pub fn open_next(&mut self) -> Result<()> {
        if self.free_segments() == 0 {
            return Err(StampError::NoSpace {
                segments: self.in_use(),
            });
        }
        let seq = self.head_seq + 1;
        self.erase_pages(seq, 0)?;
        let slot = self.slot(seq);
        self.summaries[slot] = SegmentSummary::open(seq);
        self.head_seq = seq;
        self.head_page = 0;
        debug!(seq, slot, "Opened segment");
        Ok(())
    }

    /// Erases the tail segment and advances the tail.
    pub fn release_tail(&mut self) -> Result<()> {
        if self.tail_seq >= self.head_seq {
            return Err(StampError::Busy("cannot release the head segment".to_string()));
        }
        let seq = self.tail_seq;
        self.erase_pages(seq, 0)?;
        let slot = self.slot(seq);
        self.summaries[slot] = SegmentSummary::free();
        self.tail_seq += 1;
        debug!(seq, new_tail = self.tail_seq, "Released segment");
        Ok(())
    }

    /// Erases pages `from..16` of segment `seq`'s slot.
    pub(crate) fn erase_pages(&mut self, seq: u32, from: u8) -> Result<()> {
        let erased = [ERASED; PAGE_BYTES];
        for page in from..PAGES_PER_SEGMENT as u8 {
            let offset = self.page_offset(seq, page);
            self.region.write_at(offset, &erased)?;
        }
        self.region.sync(self.sync_mode)?;
        Ok(())
    }
}
