//! Range query cursors.
//!
//! A [`QueryCursor`] walks the log from the tail towards the head, skipping
//! segments whose zone map excludes the series or time window, and decodes
//! matching blocks a batch at a time into cursor-local buffers. Rows come out
//! in storage order: oldest block first, samples within a block in the order
//! they were written.
//!
//! Cursors do not pin the log. Pages appended while a cursor is open are
//! seen if the cursor has not passed them yet, and segments reclaimed under
//! it are skipped.

use crate::block::{Block, SeriesId, TimeWindow, Timestamp, MAX_BLOCK_SAMPLES};
use crate::error::Result;
use crate::log::page::{self, PageBuf, PageHeader, DATA_PAGES, PAGE_BYTES};
use crate::log::SegmentRing;
use tracing::trace;

/// Cursor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Created, nothing decoded yet.
    Initialized,
    /// Rows are buffered or more blocks may follow.
    Positioned,
    /// No further rows.
    Exhausted,
}

/// An open range query over one series.
#[derive(Debug)]
pub struct QueryCursor {
    series: SeriesId,
    window: TimeWindow,
    ordered: bool,
    state: CursorState,
    seq: u32,
    page: u8,
    page_buf: PageBuf,
    header: PageHeader,
    page_loaded: bool,
    next_block: usize,
    scan_done: bool,
    block: Block,
    rows: Vec<(Timestamp, f32)>,
    row_pos: usize,
}

impl QueryCursor {
    /// Creates a cursor positioned before the first page of `start_seq`.
    ///
    /// `ordered` enables stopping at the first block that starts after `t1`
    /// when the window does not wrap.
    pub(crate) fn new(
        series: SeriesId,
        window: TimeWindow,
        ordered: bool,
        rows: usize,
        start_seq: u32,
    ) -> Self {
        Self {
            series,
            window,
            ordered: ordered && !window.wraps(),
            state: CursorState::Initialized,
            seq: start_seq,
            page: 0,
            page_buf: [0; PAGE_BYTES],
            header: PageHeader::default(),
            page_loaded: false,
            next_block: 0,
            scan_done: false,
            block: Block::default(),
            rows: Vec::with_capacity(rows.max(MAX_BLOCK_SAMPLES)),
            row_pos: 0,
        }
    }

    /// Series being queried.
    pub fn series(&self) -> SeriesId {
        self.series
    }

    /// Inclusive time window `(t0, t1)`.
    pub fn range(&self) -> (Timestamp, Timestamp) {
        (self.window.t0, self.window.t1)
    }

    /// Current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Returns the next row, decoding another batch when the buffer is
    /// drained.
    pub(crate) fn next_row(&mut self, ring: &mut SegmentRing) -> Result<Option<(Timestamp, f32)>> {
        loop {
            if let Some(&row) = self.rows.get(self.row_pos) {
                self.row_pos += 1;
                return Ok(Some(row));
            }
            if self.scan_done || self.state == CursorState::Exhausted {
                self.state = CursorState::Exhausted;
                return Ok(None);
            }
            self.fill(ring)?;
        }
    }

    /// Decodes blocks until the row buffer cannot take another full block.
    pub(crate) fn fill(&mut self, ring: &mut SegmentRing) -> Result<()> {
        self.rows.clear();
        self.row_pos = 0;
        while !self.scan_done && self.rows.len() + MAX_BLOCK_SAMPLES <= self.rows.capacity() {
            if !self.advance(ring)? {
                self.scan_done = true;
                break;
            }
            let window = self.window;
            if self.ordered && self.block.header().t0_block > window.t1 {
                self.scan_done = true;
                break;
            }
            self.rows
                .extend(self.block.samples().filter(|&(ts, _)| window.contains(ts)));
        }
        self.state = if self.rows.is_empty() && self.scan_done {
            CursorState::Exhausted
        } else {
            CursorState::Positioned
        };
        trace!(
            series = self.series,
            rows = self.rows.len(),
            seq = self.seq,
            page = self.page,
            "Decoded query batch"
        );
        Ok(())
    }

    /// Moves to the next block of the series and decodes it into
    /// `self.block`. Returns false at the end of the log.
    fn advance(&mut self, ring: &mut SegmentRing) -> Result<bool> {
        loop {
            if self.page_loaded {
                let found = page::blocks(&self.page_buf, &self.header)
                    .enumerate()
                    .skip(self.next_block)
                    .find(|(_, (_, h))| h.series == self.series);
                match found {
                    Some((i, (offset, _))) => {
                        self.next_block = i + 1;
                        if self
                            .block
                            .decode_from(page::block_bytes(&self.page_buf, offset))
                            .is_ok()
                        {
                            return Ok(true);
                        }
                    }
                    None => self.page_loaded = false,
                }
                continue;
            }

            if self.seq < ring.tail_seq() {
                self.seq = ring.tail_seq();
                self.page = 0;
            }
            if self.page >= DATA_PAGES {
                self.seq += 1;
                self.page = 0;
                continue;
            }
            if !ring.is_written(self.seq, self.page) {
                return Ok(false);
            }
            if self.page == 0 {
                let skip = ring
                    .summary(self.seq)
                    .is_some_and(|s| !s.may_contain(self.series, self.window));
                if skip {
                    self.seq += 1;
                    continue;
                }
            }

            let page = self.page;
            self.page += 1;
            if let Some(header) = ring.read_page(self.seq, page, &mut self.page_buf)? {
                self.header = header;
                self.page_loaded = true;
                self.next_block = 0;
            }
        }
    }
}
