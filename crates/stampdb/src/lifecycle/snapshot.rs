//! Index snapshots and the head hint.
//!
//! # Snapshot format
//!
//! ```text
//! +-------+---------+------------+----------+-----------+----------+-------+-----------+-------+
//! | SSNP  | version | generation | head_seq | head_page | tail_seq | count | entries.. | CRC32 |
//! | 4B    | 2B      | 8B         | 4B       | 2B        | 4B       | 4B    | 17B each  | 4B    |
//! +-------+---------+------------+----------+-----------+----------+-------+-----------+-------+
//! ```
//!
//! Each entry is `series u16, flags u8, seq u32, page u8, offset u8,
//! latest_ts u32, latest_value f32`. Two slots alternate so a torn write
//! never destroys the previous generation; loading picks the valid slot
//! with the higher generation.

use crate::block::Timestamp;
use crate::config::SyncMode;
use crate::device::{MemMetaStore, MetaFile, MetaStore};
use crate::error::{Result, StampError};
use crate::index::IndexEntry;
use crate::log::page::checksum;
use crate::log::BlockLocation;
use tracing::{debug, warn};

const SNAPSHOT_MAGIC: [u8; 4] = *b"SSNP";

const SNAPSHOT_VERSION: u16 = 1;

const HEADER_BYTES: usize = 4 + 2 + 8 + 4 + 2 + 4 + 4;

/// Serialized size of one snapshot entry.
pub const SNAPSHOT_ENTRY_BYTES: usize = 2 + 1 + 4 + 1 + 1 + 4 + 4;

/// Serialized size of a snapshot with no entries.
pub const SNAPSHOT_BASE_BYTES: usize = HEADER_BYTES + 4;

const HINT_MAGIC: [u8; 4] = *b"SHNT";

const HINT_BYTES: usize = 4 + 4 + 2 + 4;

const FLAG_ORDERED: u8 = 0x01;
const FLAG_LOCATED: u8 = 0x02;
const FLAG_LATEST: u8 = 0x04;

/// Last known write position of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadHint {
    /// Head segment sequence.
    pub seq: u32,
    /// Next page to be written in that segment.
    pub page: u8,
}

impl HeadHint {
    fn encode(&self) -> [u8; HINT_BYTES] {
        let mut buf = [0u8; HINT_BYTES];
        buf[0..4].copy_from_slice(&HINT_MAGIC);
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..10].copy_from_slice(&u16::from(self.page).to_le_bytes());
        let crc = checksum(&buf[..10]);
        buf[10..14].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != HINT_BYTES || buf[0..4] != HINT_MAGIC {
            return None;
        }
        if read_u32(buf, 10) != checksum(&buf[..10]) {
            return None;
        }
        let page = u8::try_from(read_u16(buf, 8)).ok()?;
        Some(Self {
            seq: read_u32(buf, 4),
            page,
        })
    }
}

/// A decoded snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Monotonic save counter.
    pub generation: u64,
    /// Head segment at save time.
    pub head_seq: u32,
    /// Next head page at save time.
    pub head_page: u8,
    /// Tail segment at save time.
    pub tail_seq: u32,
    entry_count: usize,
    bytes: Vec<u8>,
}

impl Snapshot {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// True if the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Iterates the index entries.
    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.bytes[HEADER_BYTES..HEADER_BYTES + self.entry_count * SNAPSHOT_ENTRY_BYTES]
            .chunks_exact(SNAPSHOT_ENTRY_BYTES)
            .map(decode_entry)
    }

    fn decode(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < SNAPSHOT_BASE_BYTES || bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(StampError::Codec("not a snapshot".to_string()));
        }
        let body = bytes.len() - 4;
        let expected = read_u32(&bytes, body);
        let actual = checksum(&bytes[..body]);
        if expected != actual {
            return Err(StampError::CrcMismatch { expected, actual });
        }
        let version = read_u16(&bytes, 4);
        if version != SNAPSHOT_VERSION {
            return Err(StampError::Codec(format!(
                "unsupported snapshot version {}",
                version
            )));
        }
        let entry_count = read_u32(&bytes, 24) as usize;
        if HEADER_BYTES + entry_count * SNAPSHOT_ENTRY_BYTES != body {
            return Err(StampError::Codec("snapshot length mismatch".to_string()));
        }
        let head_page = u8::try_from(read_u16(&bytes, 18))
            .map_err(|_| StampError::Codec("snapshot head page out of range".to_string()))?;
        Ok(Self {
            generation: read_u64(&bytes, 6),
            head_seq: read_u32(&bytes, 14),
            head_page,
            tail_seq: read_u32(&bytes, 20),
            entry_count,
            bytes,
        })
    }
}

fn encode_entry(entry: &IndexEntry, out: &mut Vec<u8>) {
    let mut flags = 0;
    if entry.ordered {
        flags |= FLAG_ORDERED;
    }
    let location = entry.location.unwrap_or(BlockLocation {
        seq: 0,
        page: 0,
        offset: 0,
    });
    if entry.location.is_some() {
        flags |= FLAG_LOCATED;
    }
    let (ts, value): (Timestamp, f32) = entry.latest.unwrap_or((0, 0.0));
    if entry.latest.is_some() {
        flags |= FLAG_LATEST;
    }
    out.extend_from_slice(&entry.series.to_le_bytes());
    out.push(flags);
    out.extend_from_slice(&location.seq.to_le_bytes());
    out.push(location.page);
    out.push(location.offset);
    out.extend_from_slice(&ts.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
}

fn decode_entry(buf: &[u8]) -> IndexEntry {
    let flags = buf[2];
    IndexEntry {
        series: read_u16(buf, 0),
        ordered: flags & FLAG_ORDERED != 0,
        location: (flags & FLAG_LOCATED != 0).then(|| BlockLocation {
            seq: read_u32(buf, 3),
            page: buf[7],
            offset: buf[8],
        }),
        latest: (flags & FLAG_LATEST != 0)
            .then(|| (read_u32(buf, 9), f32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]))),
    }
}

/// Persists snapshots and head hints through a [`MetaStore`].
pub struct SnapshotStore {
    meta: Box<dyn MetaStore>,
    sync_mode: SyncMode,
    generation: u64,
    next_slot: MetaFile,
    buf: Vec<u8>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("generation", &self.generation)
            .field("next_slot", &self.next_slot)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Wraps `meta`, using `buf` (preallocated) to serialize snapshots.
    pub fn new(meta: Box<dyn MetaStore>, sync_mode: SyncMode, buf: Vec<u8>) -> Self {
        Self {
            meta,
            sync_mode,
            generation: 0,
            next_slot: MetaFile::SnapshotA,
            buf,
        }
    }

    /// Detaches the metadata store, leaving an empty volatile one behind.
    pub fn take_meta(&mut self) -> Box<dyn MetaStore> {
        std::mem::replace(&mut self.meta, Box::new(MemMetaStore::new()))
    }

    /// Generation of the most recently loaded or saved snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn load_slot(&mut self, slot: MetaFile) -> Result<Option<Snapshot>> {
        let Some(bytes) = self.meta.load(slot)? else {
            return Ok(None);
        };
        match Snapshot::decode(bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(slot = ?slot, error = %e, "Ignoring invalid snapshot slot");
                Ok(None)
            }
        }
    }

    /// Loads the newest valid snapshot, if any, and aims the next save at
    /// the other slot.
    pub fn load(&mut self) -> Result<Option<Snapshot>> {
        let a = self.load_slot(MetaFile::SnapshotA)?;
        let b = self.load_slot(MetaFile::SnapshotB)?;
        let (slot, best) = match (a, b) {
            (Some(a), Some(b)) if b.generation > a.generation => (MetaFile::SnapshotB, Some(b)),
            (Some(a), _) => (MetaFile::SnapshotA, Some(a)),
            (None, Some(b)) => (MetaFile::SnapshotB, Some(b)),
            (None, None) => return Ok(None),
        };
        if let Some(snapshot) = &best {
            self.generation = snapshot.generation;
            self.next_slot = match slot {
                MetaFile::SnapshotA => MetaFile::SnapshotB,
                _ => MetaFile::SnapshotA,
            };
            debug!(
                slot = ?slot,
                generation = snapshot.generation,
                entries = snapshot.len(),
                "Loaded snapshot"
            );
        }
        Ok(best)
    }

    /// Writes a snapshot of `entries` with the given log position.
    pub fn save<'a>(
        &mut self,
        head: HeadHint,
        tail_seq: u32,
        entries: impl Iterator<Item = &'a IndexEntry>,
    ) -> Result<()> {
        let generation = self.generation + 1;
        let buf = &mut self.buf;
        buf.clear();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&generation.to_le_bytes());
        buf.extend_from_slice(&head.seq.to_le_bytes());
        buf.extend_from_slice(&u16::from(head.page).to_le_bytes());
        buf.extend_from_slice(&tail_seq.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut count = 0u32;
        for entry in entries.filter(|e| e.latest.is_some() || e.location.is_some()) {
            encode_entry(entry, buf);
            count += 1;
        }
        buf[24..28].copy_from_slice(&count.to_le_bytes());
        let crc = checksum(buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let slot = self.next_slot;
        self.meta.store(slot, &self.buf, self.sync_mode)?;
        self.generation = generation;
        self.next_slot = match slot {
            MetaFile::SnapshotA => MetaFile::SnapshotB,
            _ => MetaFile::SnapshotA,
        };
        debug!(slot = ?slot, generation, entries = count, "Saved snapshot");
        Ok(())
    }

    /// Loads the head hint, ignoring a damaged one.
    pub fn load_hint(&mut self) -> Result<Option<HeadHint>> {
        let hint = self
            .meta
            .load(MetaFile::HeadHint)?
            .and_then(|bytes| HeadHint::decode(&bytes));
        Ok(hint)
    }

    /// Persists the head hint.
    pub fn save_hint(&mut self, hint: HeadHint) -> Result<()> {
        self.meta
            .store(MetaFile::HeadHint, &hint.encode(), self.sync_mode)?;
        Ok(())
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
