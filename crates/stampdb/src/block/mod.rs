//! Sample types and the quantized block codec.
//!
//! A [`Block`] is the on-media compression unit: up to
//! [`MAX_BLOCK_SAMPLES`] samples of a single series, stored as bit-packed
//! time deltas plus 16-bit quantized values with a per-block affine
//! dequantization (`value = bias + scale * qval`).

pub mod codec;

pub use codec::{
    dt_bits_for, encoded_len, fits_block, Block, BlockHeader, BLOCK_HEADER_BYTES, MAX_BLOCK_BYTES,
    MAX_BLOCK_SAMPLES,
};

/// Series identifier.
pub type SeriesId = u16;

/// Millisecond timestamp. Wraps past `u32::MAX` after about 49.7 days.
pub type Timestamp = u32;

/// Inclusive query window over wrapping timestamps.
///
/// A window with `t0 > t1` straddles the wrap and selects `[t0, u32::MAX]`
/// followed by `[0, t1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// First timestamp of the window.
    pub t0: Timestamp,
    /// Last timestamp of the window.
    pub t1: Timestamp,
}

impl TimeWindow {
    /// Creates the window `t0..=t1`.
    pub fn new(t0: Timestamp, t1: Timestamp) -> Self {
        Self { t0, t1 }
    }

    /// True if the window crosses the timestamp wrap.
    pub fn wraps(&self) -> bool {
        self.t0 > self.t1
    }

    /// True if `ts` falls inside the window.
    pub fn contains(&self, ts: Timestamp) -> bool {
        if self.wraps() {
            ts >= self.t0 || ts <= self.t1
        } else {
            ts >= self.t0 && ts <= self.t1
        }
    }

    /// True if any timestamp of the plain range `lo..=hi` falls inside the
    /// window.
    pub fn overlaps(&self, lo: Timestamp, hi: Timestamp) -> bool {
        if self.wraps() {
            hi >= self.t0 || lo <= self.t1
        } else {
            lo <= self.t1 && hi >= self.t0
        }
    }
}

/// A single time series sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Series the sample belongs to.
    pub series: SeriesId,
    /// Timestamp in milliseconds.
    pub ts_ms: Timestamp,
    /// Sample value.
    pub value: f32,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(series: SeriesId, ts_ms: Timestamp, value: f32) -> Self {
        Self {
            series,
            ts_ms,
            value,
        }
    }
}
