//! Quantized block codec.
//!
//! ## Block Layout
//!
//! ```text
//! offset  size                     field
//! 0       2                        series (u16 LE)
//! 2       1                        count (1..=74)
//! 3       1                        dt_bits (0, 1, 2, 4, 8, 16 or 32)
//! 4       4                        t0_block (u32 LE)
//! 8       4                        bias (f32 LE)
//! 12      4                        scale (f32 LE)
//! 16      ceil(count*dt_bits/8)    deltas, MSB-first bit packed
//! ..      2*count                  qvals (i16 LE)
//! ```
//!
//! Time deltas are relative to the previous sample (`t0_block` for the
//! first, so `deltas[0] == 0`) and use wrapping arithmetic, which keeps the
//! timestamp reconstruction exact even for out-of-order writes.

use super::{SeriesId, Timestamp};
use crate::error::{Result, StampError};
use bitvec::prelude::*;

/// Maximum number of samples in one block.
pub const MAX_BLOCK_SAMPLES: usize = 74;

/// Fixed block header size in bytes.
pub const BLOCK_HEADER_BYTES: usize = 16;

/// Maximum encoded block size; equal to the block area of a data page.
pub const MAX_BLOCK_BYTES: usize = 240;

/// Permitted delta lane widths, narrowest first.
const DT_WIDTHS: [u8; 7] = [0, 1, 2, 4, 8, 16, 32];

/// Largest qval magnitude; keeps the range symmetric around `bias`.
const QMAX: f64 = 32767.0;

/// Returns the narrowest permitted width that can hold `max_delta`.
pub fn dt_bits_for(max_delta: u32) -> u8 {
    let needed = 32 - max_delta.leading_zeros();
    DT_WIDTHS
        .iter()
        .copied()
        .find(|&w| u32::from(w) >= needed)
        .unwrap_or(32)
}

/// Encoded size in bytes of a block with `count` samples at `dt_bits`.
pub fn encoded_len(count: usize, dt_bits: u8) -> usize {
    BLOCK_HEADER_BYTES + (count * dt_bits as usize).div_ceil(8) + 2 * count
}

/// Returns true if `count` samples at `dt_bits` fit in a single block.
pub fn fits_block(count: usize, dt_bits: u8) -> bool {
    count <= MAX_BLOCK_SAMPLES && encoded_len(count, dt_bits) <= MAX_BLOCK_BYTES
}

/// The fixed-size header at the front of every encoded block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockHeader {
    /// Series the block belongs to.
    pub series: SeriesId,
    /// Number of samples.
    pub count: u8,
    /// Width of each packed delta.
    pub dt_bits: u8,
    /// Base timestamp.
    pub t0_block: Timestamp,
    /// Dequantization offset.
    pub bias: f32,
    /// Dequantization step.
    pub scale: f32,
}

impl BlockHeader {
    /// Parses and sanity-checks a header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_BYTES {
            return Err(StampError::Codec("truncated block header".to_string()));
        }
        let header = Self {
            series: u16::from_le_bytes([buf[0], buf[1]]),
            count: buf[2],
            dt_bits: buf[3],
            t0_block: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            bias: f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            scale: f32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };
        if header.count == 0 || header.count as usize > MAX_BLOCK_SAMPLES {
            return Err(StampError::Codec(format!(
                "block count {} out of range",
                header.count
            )));
        }
        if !DT_WIDTHS.contains(&header.dt_bits) {
            return Err(StampError::Codec(format!(
                "unsupported dt_bits {}",
                header.dt_bits
            )));
        }
        if header.encoded_len() > MAX_BLOCK_BYTES || header.encoded_len() > buf.len() {
            return Err(StampError::Codec("block overruns its page".to_string()));
        }
        Ok(header)
    }

    /// Encoded size of the whole block this header describes.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.count as usize, self.dt_bits)
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.series.to_le_bytes());
        out[2] = self.count;
        out[3] = self.dt_bits;
        out[4..8].copy_from_slice(&self.t0_block.to_le_bytes());
        out[8..12].copy_from_slice(&self.bias.to_le_bytes());
        out[12..16].copy_from_slice(&self.scale.to_le_bytes());
    }
}

/// A decoded block. Immutable once written to the log.
///
/// Storage is fixed-size so decode scratch can be allocated once and reused.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    header: BlockHeader,
    deltas: [u32; MAX_BLOCK_SAMPLES],
    qvals: [i16; MAX_BLOCK_SAMPLES],
}

impl Default for Block {
    fn default() -> Self {
        Self {
            header: BlockHeader {
                series: 0,
                count: 0,
                dt_bits: 0,
                t0_block: 0,
                bias: 0.0,
                scale: 1.0,
            },
            deltas: [0; MAX_BLOCK_SAMPLES],
            qvals: [0; MAX_BLOCK_SAMPLES],
        }
    }
}

impl Block {
    /// Encodes a run of `(timestamp, value)` samples of one series.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the run is empty, longer than
    /// [`MAX_BLOCK_SAMPLES`], contains non-finite values, or needs a delta
    /// width that would overflow the block budget.
    pub fn encode(series: SeriesId, samples: &[(Timestamp, f32)]) -> Result<Self> {
        let mut block = Self::default();
        block.encode_into(series, samples)?;
        Ok(block)
    }

    /// Encodes into `self`, reusing its storage.
    pub fn encode_into(&mut self, series: SeriesId, samples: &[(Timestamp, f32)]) -> Result<()> {
        let count = samples.len();
        if count == 0 || count > MAX_BLOCK_SAMPLES {
            return Err(StampError::Codec(format!(
                "cannot encode {} samples into a block",
                count
            )));
        }
        if samples.iter().any(|&(_, v)| !v.is_finite()) {
            return Err(StampError::Codec("non-finite sample value".to_string()));
        }

        let t0_block = samples[0].0;
        let mut prev = t0_block;
        let mut max_delta = 0u32;
        for (i, &(ts, _)) in samples.iter().enumerate() {
            let delta = ts.wrapping_sub(prev);
            self.deltas[i] = delta;
            max_delta = max_delta.max(delta);
            prev = ts;
        }
        let dt_bits = dt_bits_for(max_delta);
        if !fits_block(count, dt_bits) {
            return Err(StampError::Codec(format!(
                "{} samples at dt_bits {} exceed block budget",
                count, dt_bits
            )));
        }

        let (bias, scale) = quantization_params(samples.iter().map(|&(_, v)| v));
        for (i, &(_, v)) in samples.iter().enumerate() {
            self.qvals[i] = quantize(v, bias, scale);
        }

        self.header = BlockHeader {
            series,
            count: count as u8,
            dt_bits,
            t0_block,
            bias,
            scale,
        };
        Ok(())
    }

    /// Decodes a block from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut block = Self::default();
        block.decode_from(buf)?;
        Ok(block)
    }

    /// Decodes into `self`, reusing its storage. Returns the bytes consumed.
    pub fn decode_from(&mut self, buf: &[u8]) -> Result<usize> {
        let header = BlockHeader::parse(buf)?;
        let count = header.count as usize;
        let width = header.dt_bits as usize;
        let delta_bytes = (count * width).div_ceil(8);

        let lanes = &buf[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + delta_bytes];
        let bits = lanes.view_bits::<Msb0>();
        for i in 0..count {
            self.deltas[i] = if width == 0 {
                0
            } else {
                bits[i * width..(i + 1) * width].load_be::<u32>()
            };
        }

        let qstart = BLOCK_HEADER_BYTES + delta_bytes;
        for i in 0..count {
            let at = qstart + 2 * i;
            self.qvals[i] = i16::from_le_bytes([buf[at], buf[at + 1]]);
        }

        self.header = header;
        Ok(header.encoded_len())
    }

    /// Serializes the block into `out`, returning the bytes written.
    ///
    /// `out` must be at least [`Block::encoded_len`] bytes long.
    pub fn write_to(&self, out: &mut [u8]) -> usize {
        let count = self.len();
        let width = self.header.dt_bits as usize;
        let delta_bytes = (count * width).div_ceil(8);
        let total = self.encoded_len();

        self.header.write_to(&mut out[..BLOCK_HEADER_BYTES]);

        let lanes = &mut out[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + delta_bytes];
        lanes.fill(0);
        if width > 0 {
            let bits = lanes.view_bits_mut::<Msb0>();
            for i in 0..count {
                bits[i * width..(i + 1) * width].store_be::<u32>(self.deltas[i]);
            }
        }

        let qstart = BLOCK_HEADER_BYTES + delta_bytes;
        for i in 0..count {
            let at = qstart + 2 * i;
            out[at..at + 2].copy_from_slice(&self.qvals[i].to_le_bytes());
        }
        total
    }

    /// Returns the block header.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Series the block belongs to.
    pub fn series(&self) -> SeriesId {
        self.header.series
    }

    /// Number of samples in the block.
    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    /// Returns true if the block holds no samples (only a default scratch block).
    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.header.encoded_len()
    }

    /// Per-sample time deltas.
    pub fn deltas(&self) -> &[u32] {
        &self.deltas[..self.len()]
    }

    /// Quantized values.
    pub fn qvals(&self) -> &[i16] {
        &self.qvals[..self.len()]
    }

    /// Iterates the decoded `(timestamp, value)` pairs in storage order.
    pub fn samples(&self) -> impl Iterator<Item = (Timestamp, f32)> + '_ {
        let BlockHeader {
            t0_block,
            bias,
            scale,
            ..
        } = self.header;
        self.deltas()
            .iter()
            .zip(self.qvals())
            .scan(t0_block, move |ts, (&delta, &q)| {
                *ts = ts.wrapping_add(delta);
                Some((*ts, bias + scale * f32::from(q)))
            })
    }

    /// The last decoded sample of the block.
    pub fn last_sample(&self) -> Option<(Timestamp, f32)> {
        self.samples().last()
    }

    /// Smallest and largest timestamp in the block.
    pub fn time_bounds(&self) -> (Timestamp, Timestamp) {
        self.samples()
            .fold((u32::MAX, u32::MIN), |(lo, hi), (ts, _)| {
                (lo.min(ts), hi.max(ts))
            })
    }
}

/// Picks `bias`/`scale` so the block's value range maps onto `[-32767, 32767]`.
fn quantization_params(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(f64::from(v)), hi.max(f64::from(v)))
    });
    if max == min {
        return (min as f32, 1.0);
    }
    let bias = ((min + max) / 2.0) as f32;
    let scale = ((max - min) / (2.0 * QMAX)) as f32;
    if scale == 0.0 || !scale.is_finite() {
        // range collapsed below f32 resolution
        return (bias, 1.0);
    }
    (bias, scale)
}

fn quantize(value: f32, bias: f32, scale: f32) -> i16 {
    let q = (f64::from(value) - f64::from(bias)) / f64::from(scale);
    q.round().clamp(-QMAX, QMAX) as i16
}
