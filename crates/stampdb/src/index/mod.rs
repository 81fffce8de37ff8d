//! Write buffer and series index.
//!
//! Each series owns one fixed-size slot holding its index entry (latest
//! committed value, location of its newest block, ordering flag) and its
//! pending run of not-yet-encoded samples. Slots are carved from the
//! [`Workspace`] at open; a new series with no free slot is rejected with
//! [`StampError::Capacity`].

pub mod workspace;

pub use workspace::Workspace;

use crate::block::{dt_bits_for, fits_block, Block, SeriesId, Timestamp, MAX_BLOCK_SAMPLES};
use crate::error::{Result, StampError};
use crate::log::BlockLocation;
use std::collections::HashMap;
use std::mem::size_of;
use std::time::Instant;

/// Committed state of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    /// Series identifier.
    pub series: SeriesId,
    /// Latest committed sample, exactly as written.
    pub latest: Option<(Timestamp, f32)>,
    /// Location of the series' newest block, if it is still in the log.
    pub location: Option<BlockLocation>,
    /// True while every sample has had a non-decreasing timestamp.
    pub ordered: bool,
}

impl IndexEntry {
    fn new(series: SeriesId) -> Self {
        Self {
            series,
            latest: None,
            location: None,
            ordered: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRun {
    samples: [(Timestamp, f32); MAX_BLOCK_SAMPLES],
    len: usize,
    dt_bits: u8,
}

impl PendingRun {
    fn new() -> Self {
        Self {
            samples: [(0, 0.0); MAX_BLOCK_SAMPLES],
            len: 0,
            dt_bits: 0,
        }
    }

    /// Width the run would need after appending `ts`.
    fn widened(&self, ts: Timestamp) -> u8 {
        match self.len {
            0 => 0,
            n => self.dt_bits.max(dt_bits_for(ts.wrapping_sub(self.samples[n - 1].0))),
        }
    }

    fn accepts(&self, ts: Timestamp) -> bool {
        self.len < MAX_BLOCK_SAMPLES && fits_block(self.len + 1, self.widened(ts))
    }

    fn push(&mut self, ts: Timestamp, value: f32) {
        self.dt_bits = self.widened(ts);
        self.samples[self.len] = (ts, value);
        self.len += 1;
    }

    fn clear(&mut self) {
        self.len = 0;
        self.dt_bits = 0;
    }
}

#[derive(Debug, Clone)]
struct SeriesSlot {
    entry: IndexEntry,
    run: PendingRun,
    newest_ts: Option<Timestamp>,
}

/// Workspace bytes consumed by one series slot, including its lookup entry.
pub const SLOT_BYTES: usize = size_of::<SeriesSlot>() + size_of::<(SeriesId, usize)>() + 1;

/// Fixed-capacity series index with per-series pending runs.
#[derive(Debug)]
pub struct SeriesIndex {
    slots: Vec<SeriesSlot>,
    lookup: HashMap<SeriesId, usize>,
    capacity: usize,
    pending: usize,
    pending_since: Option<Instant>,
}

impl SeriesIndex {
    /// Sizes the index to fill the rest of `workspace`, charging
    /// `extra_per_slot` additional bytes per slot for state kept elsewhere.
    pub fn new(workspace: &mut Workspace, extra_per_slot: usize) -> Result<Self> {
        let per_slot = SLOT_BYTES + extra_per_slot;
        let capacity = (workspace.remaining() / per_slot).min(usize::from(u16::MAX) + 1);
        if capacity == 0 {
            return Err(StampError::invalid(format!(
                "workspace of {} bytes leaves no room for a series slot",
                workspace.budget()
            )));
        }
        workspace.reserve("series slots", capacity * per_slot)?;
        Ok(Self {
            slots: Vec::with_capacity(capacity),
            lookup: HashMap::with_capacity(capacity),
            capacity,
            pending: 0,
            pending_since: None,
        })
    }

    /// Maximum number of series.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Series currently tracked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no series is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Committed state of `series`.
    pub fn get(&self, series: SeriesId) -> Option<&IndexEntry> {
        self.lookup.get(&series).map(|&slot| &self.slots[slot].entry)
    }

    /// Returns the slot of `series`, assigning a free one if needed.
    pub fn ensure_slot(&mut self, series: SeriesId) -> Result<usize> {
        if let Some(&slot) = self.lookup.get(&series) {
            return Ok(slot);
        }
        if self.slots.len() >= self.capacity {
            return Err(StampError::Capacity {
                series_slots: self.capacity,
            });
        }
        let slot = self.slots.len();
        self.slots.push(SeriesSlot {
            entry: IndexEntry::new(series),
            run: PendingRun::new(),
            newest_ts: None,
        });
        self.lookup.insert(series, slot);
        Ok(slot)
    }

    /// Committed state of the series in `slot`.
    pub fn entry(&self, slot: usize) -> &IndexEntry {
        &self.slots[slot].entry
    }

    /// Iterates all index entries.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> + '_ {
        self.slots.iter().map(|slot| &slot.entry)
    }

    /// True if `ts` can join the pending run of `slot` without exceeding
    /// the block size limits.
    pub fn accepts(&self, slot: usize, ts: Timestamp) -> bool {
        self.slots[slot].run.accepts(ts)
    }

    /// Appends a sample to the pending run of `slot`.
    ///
    /// The caller must have checked [`SeriesIndex::accepts`].
    pub fn push(&mut self, slot: usize, ts: Timestamp, value: f32) {
        let state = &mut self.slots[slot];
        if state.newest_ts.is_some_and(|prev| ts < prev) {
            state.entry.ordered = false;
        }
        state.newest_ts = Some(ts);
        if state.run.len == 0 {
            self.pending += 1;
            if self.pending_since.is_none() {
                self.pending_since = Some(Instant::now());
            }
        }
        state.run.push(ts, value);
    }

    /// True if the pending run of `slot` holds the maximum sample count.
    pub fn run_is_full(&self, slot: usize) -> bool {
        self.slots[slot].run.len == MAX_BLOCK_SAMPLES
    }

    /// Pending samples of `slot` in arrival order.
    pub fn run(&self, slot: usize) -> &[(Timestamp, f32)] {
        let run = &self.slots[slot].run;
        &run.samples[..run.len]
    }

    /// Encodes the pending run of `slot` into `block`.
    pub fn encode_run(&self, slot: usize, block: &mut Block) -> Result<()> {
        block.encode_into(self.slots[slot].entry.series, self.run(slot))
    }

    /// Marks the pending run of `slot` as written at `location`, updating
    /// the committed latest value from the run's raw last sample.
    pub fn commit_run(&mut self, slot: usize, location: BlockLocation) {
        let state = &mut self.slots[slot];
        if state.run.len == 0 {
            return;
        }
        state.entry.latest = Some(state.run.samples[state.run.len - 1]);
        state.entry.location = Some(location);
        state.run.clear();
        self.pending -= 1;
        if self.pending == 0 {
            self.pending_since = None;
        }
    }

    /// Number of series with pending samples.
    pub fn pending_runs(&self) -> usize {
        self.pending
    }

    /// When the oldest pending sample was buffered.
    pub fn pending_since(&self) -> Option<Instant> {
        self.pending_since
    }

    /// Points the entry of `slot` at a relocated copy of its newest block.
    pub fn relocate(&mut self, slot: usize, location: Option<BlockLocation>) {
        self.slots[slot].entry.location = location;
    }

    /// Installs a committed entry loaded from a snapshot.
    pub fn restore(&mut self, entry: IndexEntry) -> Result<()> {
        let slot = self.ensure_slot(entry.series)?;
        let state = &mut self.slots[slot];
        state.entry = entry;
        state.newest_ts = entry.latest.map(|(ts, _)| ts);
        Ok(())
    }

    /// Folds a block found in the log into the index.
    ///
    /// For relocated copies the location moves but an already known latest
    /// value is kept, since it is the unquantized original.
    pub fn apply_block(
        &mut self,
        block: &Block,
        location: BlockLocation,
        relocated: bool,
    ) -> Result<()> {
        let slot = self.ensure_slot(block.series())?;
        let state = &mut self.slots[slot];
        state.entry.location = Some(location);
        if relocated && state.entry.latest.is_some() {
            return Ok(());
        }

        let mut prev = state.newest_ts;
        for (ts, _) in block.samples() {
            if prev.is_some_and(|p| ts < p) {
                state.entry.ordered = false;
            }
            prev = Some(ts);
        }
        state.newest_ts = prev;
        state.entry.latest = block.last_sample();
        Ok(())
    }

    /// Forgets every series, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.lookup.clear();
        self.pending = 0;
        self.pending_since = None;
    }
}
