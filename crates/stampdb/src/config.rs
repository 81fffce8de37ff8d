//! Engine configuration.
//!
//! All sizing decisions are made once at [`StampDb::open`](crate::StampDb::open):
//! the engine never grows its in-memory state past what `workspace_bytes`
//! allows.

use crate::block::MAX_BLOCK_SAMPLES;
use crate::error::{Result, StampError};

/// Default workspace size (1 MiB).
pub const DEFAULT_WORKSPACE_BYTES: usize = 1024 * 1024;

/// Smallest workspace accepted by `open`.
pub const MIN_WORKSPACE_BYTES: usize = 4096;

/// Default number of rows a cursor pre-decodes per batch.
pub const DEFAULT_READ_BATCH_ROWS: usize = 256;

/// Default number of blocks between head hint updates.
pub const DEFAULT_HINT_INTERVAL_BLOCKS: u32 = 64;

/// Sync mode for region and metadata durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each page and metadata write (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    pub(crate) fn apply(self, file: &std::fs::File) -> std::io::Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all(),
            SyncMode::Fdatasync => file.sync_data(),
            SyncMode::None => Ok(()),
        }
    }
}

/// Configuration for a StampDB instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on all dynamic engine state (write buffer, series index,
    /// zone map, decode scratch).
    pub workspace_bytes: usize,
    /// Rows a query cursor pre-decodes per batch.
    pub read_batch_rows: usize,
    /// Auto-flush pending writes after this many milliseconds (0 = flush only
    /// on explicit request or when a run fills up).
    pub commit_interval_ms: u32,
    /// Free segments the garbage collector keeps ahead of the log head.
    pub gc_reserve_segments: u32,
    /// Blocks written between head hint updates.
    pub hint_interval_blocks: u32,
    /// Durability mode for file-backed devices.
    pub sync_mode: SyncMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_bytes: DEFAULT_WORKSPACE_BYTES,
            read_batch_rows: DEFAULT_READ_BATCH_ROWS,
            commit_interval_ms: 0,
            gc_reserve_segments: 1,
            hint_interval_blocks: DEFAULT_HINT_INTERVAL_BLOCKS,
            sync_mode: SyncMode::default(),
        }
    }
}

impl Config {
    /// Creates a configuration with the given workspace size and defaults
    /// for everything else.
    pub fn with_workspace(workspace_bytes: usize) -> Self {
        Self {
            workspace_bytes,
            ..Self::default()
        }
    }

    /// Rows held by the query row buffer: the batch size, rounded up so one
    /// whole block always fits.
    pub fn cursor_rows(&self) -> usize {
        self.read_batch_rows.max(MAX_BLOCK_SAMPLES)
    }

    /// Checks the configuration against a log of `segment_count` segments.
    pub fn validate(&self, segment_count: u32) -> Result<()> {
        if self.workspace_bytes < MIN_WORKSPACE_BYTES {
            return Err(StampError::invalid(format!(
                "workspace_bytes {} below minimum {}",
                self.workspace_bytes, MIN_WORKSPACE_BYTES
            )));
        }
        if self.read_batch_rows == 0 {
            return Err(StampError::invalid("read_batch_rows must be non-zero"));
        }
        if self.gc_reserve_segments == 0 || self.gc_reserve_segments + 2 > segment_count {
            return Err(StampError::invalid(format!(
                "gc_reserve_segments {} invalid for a log of {} segments",
                self.gc_reserve_segments, segment_count
            )));
        }
        if self.hint_interval_blocks == 0 {
            return Err(StampError::invalid("hint_interval_blocks must be non-zero"));
        }
        Ok(())
    }
}
