//! Page and segment-footer formats.
//!
//! ```text
//! Data page (256 bytes):
//! +-------+-------+-------+---------+-----+-------+-------+------------+-------+
//! | magic | flags | count | seg_seq | lag | index | total | blocks 240 | CRC32 |
//! |  2B   |  1B   |  1B   |   4B    | 2B  |  1B   |  1B   |  0xFF fill |  4B   |
//! +-------+-------+-------+---------+-----+-------+-------+------------+-------+
//! ```
//!
//! The CRC covers bytes `0..252`. A page of all `0xFF` is erased; anything
//! else that fails the magic or CRC check is corrupt.

use crate::block::{Block, BlockHeader, SeriesId, Timestamp, MAX_BLOCK_BYTES};
use crate::device::ERASED;

/// Bytes per page.
pub const PAGE_BYTES: usize = 256;

/// Pages per segment, including the footer page.
pub const PAGES_PER_SEGMENT: usize = 16;

/// Pages per segment that carry blocks.
pub const DATA_PAGES: u8 = 15;

/// Bytes per segment.
pub const SEGMENT_BYTES: usize = PAGE_BYTES * PAGES_PER_SEGMENT;

/// Fixed header at the front of every data page.
pub const PAGE_HEADER_BYTES: usize = 12;

/// Bytes available for blocks in a data page.
pub const BLOCK_AREA_BYTES: usize = MAX_BLOCK_BYTES;

/// Smallest possible block: one sample with zero-width deltas.
const MIN_BLOCK_BYTES: usize = crate::block::BLOCK_HEADER_BYTES + 2;

/// Maximum number of blocks a page can hold.
pub const MAX_BLOCKS_PER_PAGE: usize = BLOCK_AREA_BYTES / MIN_BLOCK_BYTES;

const CRC_OFFSET: usize = PAGE_HEADER_BYTES + BLOCK_AREA_BYTES;

const PAGE_MAGIC: u16 = 0x5350;

const FOOTER_MAGIC: u32 = 0x5346_4731;

/// Page flag: the page belongs to a relocation group written by GC.
pub const FLAG_RELOCATION: u8 = 0x01;

/// A raw page buffer.
pub type PageBuf = [u8; PAGE_BYTES];

/// CRC-32 of `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Decoded data page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    /// Page flags ([`FLAG_RELOCATION`]).
    pub flags: u8,
    /// Blocks stored in the page.
    pub block_count: u8,
    /// Sequence number of the owning segment.
    pub seg_seq: u32,
    /// For relocation pages: `seg_seq - source_seq`.
    pub reloc_lag: u16,
    /// For relocation pages: position within the group.
    pub reloc_index: u8,
    /// For relocation pages: number of pages in the group.
    pub reloc_total: u8,
}

impl PageHeader {
    /// Header of an ordinary data page.
    pub fn data(seg_seq: u32) -> Self {
        Self {
            seg_seq,
            ..Self::default()
        }
    }

    /// Header of page `index` of a relocation group of `total` pages
    /// copying blocks out of segment `source_seq`.
    pub fn relocation(seg_seq: u32, source_seq: u32, index: u8, total: u8) -> Self {
        Self {
            flags: FLAG_RELOCATION,
            block_count: 0,
            seg_seq,
            reloc_lag: seg_seq.wrapping_sub(source_seq) as u16,
            reloc_index: index,
            reloc_total: total,
        }
    }

    /// True for pages written by GC relocation.
    pub fn is_relocation(&self) -> bool {
        self.flags & FLAG_RELOCATION != 0
    }

    /// Segment the relocated blocks were copied from.
    pub fn source_seq(&self) -> u32 {
        self.seg_seq.wrapping_sub(u32::from(self.reloc_lag))
    }
}

/// Result of inspecting a page read back from the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Every byte is erased.
    Erased,
    /// Checksum and magic are valid.
    Valid(PageHeader),
    /// Bytes are present but fail validation.
    Corrupt {
        /// CRC stored in the page.
        expected: u32,
        /// CRC computed over the page body.
        actual: u32,
    },
}

/// Validates a page.
pub fn inspect(buf: &PageBuf) -> PageStatus {
    if buf.iter().all(|&b| b == ERASED) {
        return PageStatus::Erased;
    }
    let expected = read_u32(buf, CRC_OFFSET);
    let actual = checksum(&buf[..CRC_OFFSET]);
    if expected != actual || read_u16(buf, 0) != PAGE_MAGIC {
        return PageStatus::Corrupt { expected, actual };
    }
    PageStatus::Valid(PageHeader {
        flags: buf[2],
        block_count: buf[3],
        seg_seq: read_u32(buf, 4),
        reloc_lag: read_u16(buf, 8),
        reloc_index: buf[10],
        reloc_total: buf[11],
    })
}

/// Iterates the blocks of a valid page as `(offset, header)` pairs, where
/// `offset` is relative to the block area.
pub fn blocks<'a>(buf: &'a PageBuf, header: &PageHeader) -> PageBlocks<'a> {
    PageBlocks {
        area: &buf[PAGE_HEADER_BYTES..CRC_OFFSET],
        offset: 0,
        remaining: header.block_count,
    }
}

/// Bytes of the block starting at `offset` within the block area.
pub fn block_bytes(buf: &PageBuf, offset: u8) -> &[u8] {
    &buf[PAGE_HEADER_BYTES + offset as usize..CRC_OFFSET]
}

/// Iterator returned by [`blocks`].
#[derive(Debug)]
pub struct PageBlocks<'a> {
    area: &'a [u8],
    offset: usize,
    remaining: u8,
}

impl Iterator for PageBlocks<'_> {
    type Item = (u8, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.offset >= self.area.len() {
            return None;
        }
        // A header that does not parse ends the page; the CRC already passed
        // so this only happens with a foreign writer.
        let header = BlockHeader::parse(&self.area[self.offset..]).ok()?;
        let at = self.offset as u8;
        self.offset += header.encoded_len();
        self.remaining -= 1;
        Some((at, header))
    }
}

/// Accumulates blocks into a page image.
#[derive(Debug, Clone)]
pub struct PageBuilder {
    buf: PageBuf,
    used: usize,
    block_count: u8,
}

impl Default for PageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            buf: [ERASED; PAGE_BYTES],
            used: 0,
            block_count: 0,
        }
    }

    /// Clears the builder for reuse.
    pub fn reset(&mut self) {
        self.buf.fill(ERASED);
        self.used = 0;
        self.block_count = 0;
    }

    /// Free bytes left in the block area.
    pub fn remaining(&self) -> usize {
        BLOCK_AREA_BYTES - self.used
    }

    /// True if no block has been added.
    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// Blocks added so far.
    pub fn block_count(&self) -> u8 {
        self.block_count
    }

    /// True if a block of `len` bytes still fits.
    pub fn fits(&self, len: usize) -> bool {
        len <= self.remaining()
    }

    /// Appends a block, returning its offset within the block area, or
    /// `None` if it does not fit.
    pub fn push(&mut self, block: &Block) -> Option<u8> {
        if !self.fits(block.encoded_len()) {
            return None;
        }
        let at = self.used;
        let start = PAGE_HEADER_BYTES + at;
        self.used += block.write_to(&mut self.buf[start..CRC_OFFSET]);
        self.block_count += 1;
        Some(at as u8)
    }

    /// Stamps the header and checksum and returns the finished page image.
    pub fn finish(&mut self, header: PageHeader) -> &PageBuf {
        let buf = &mut self.buf;
        buf[0..2].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf[2] = header.flags;
        buf[3] = self.block_count;
        buf[4..8].copy_from_slice(&header.seg_seq.to_le_bytes());
        buf[8..10].copy_from_slice(&header.reloc_lag.to_le_bytes());
        buf[10] = header.reloc_index;
        buf[11] = header.reloc_total;
        let crc = checksum(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        &self.buf
    }
}

/// A 256-bit membership filter over `series & 0xFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeriesFilter([u8; 32]);

impl SeriesFilter {
    /// Marks `series` as present.
    pub fn insert(&mut self, series: SeriesId) {
        let bit = (series & 0xFF) as usize;
        self.0[bit / 8] |= 1 << (bit % 8);
    }

    /// False only if `series` is definitely absent.
    pub fn may_contain(&self, series: SeriesId) -> bool {
        let bit = (series & 0xFF) as usize;
        self.0[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.0 = [0; 32];
    }
}

/// Summary written to the last page of a sealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    /// Sequence number of the segment.
    pub seg_seq: u32,
    /// Blocks stored in the segment.
    pub block_count: u32,
    /// Earliest block timestamp.
    pub t_min: Timestamp,
    /// Latest block timestamp.
    pub t_max: Timestamp,
    /// Series present in the segment.
    pub filter: SeriesFilter,
}

const FOOTER_BYTES: usize = 4 + 4 + 4 + 4 + 4 + 32;

impl SegmentFooter {
    /// Serializes the footer into a page image.
    pub fn encode(&self) -> PageBuf {
        let mut buf = [ERASED; PAGE_BYTES];
        buf[0..4].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.seg_seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.t_min.to_le_bytes());
        buf[16..20].copy_from_slice(&self.t_max.to_le_bytes());
        buf[20..52].copy_from_slice(&self.filter.0);
        let crc = checksum(&buf[..FOOTER_BYTES - 4]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses a footer page, returning `None` unless magic and CRC match.
    pub fn decode(buf: &PageBuf) -> Option<Self> {
        if read_u32(buf, 0) != FOOTER_MAGIC {
            return None;
        }
        if read_u32(buf, 52) != checksum(&buf[..FOOTER_BYTES - 4]) {
            return None;
        }
        let mut filter = [0u8; 32];
        filter.copy_from_slice(&buf[20..52]);
        Some(Self {
            seg_seq: read_u32(buf, 4),
            block_count: read_u32(buf, 8),
            t_min: read_u32(buf, 12),
            t_max: read_u32(buf, 16),
            filter: SeriesFilter(filter),
        })
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
