//! StampDB - Fixed-Memory Log-Structured Time Series Storage
//!
//! This crate provides an embedded store for `(series, timestamp, value)`
//! samples on a flat, erase-before-write style region. All in-memory state is
//! carved out of a fixed workspace at open, so memory use never grows with the
//! amount of data written.
//!
//! # Components
//!
//! - [`Block`]: Quantized, delta-packed compression unit
//! - [`SegmentRing`](log::SegmentRing): Circular log of 4 KiB segments
//! - [`SeriesIndex`](index::SeriesIndex): Write buffer and latest-value index
//! - [`GarbageCollector`](lifecycle::GarbageCollector): Tail reclamation
//! - [`StampDb`]: The engine tying them together
//!
//! # Example
//!
//! ```rust,ignore
//! use stampdb::{Config, Device, StampDb};
//!
//! let device = Device::open_dir("/var/lib/stamp", 256 * 1024)?;
//! let mut db = StampDb::open(device, Config::default())?;
//!
//! for i in 0..20u32 {
//!     db.write(1, i * 100, i as f32 * 0.5)?;
//! }
//! db.flush()?;
//!
//! assert_eq!(db.query_latest(1)?, (1900, 9.5));
//! for row in db.query(1, 0, 1900)? {
//!     let (ts, value) = row?;
//!     println!("{ts} {value}");
//! }
//!
//! let device = db.close()?;
//! ```

#![deny(missing_docs)]

pub mod block;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod log;
pub mod query;

pub use block::{Block, Sample, SeriesId, TimeWindow, Timestamp};
pub use config::{Config, SyncMode};
pub use db::{Rows, StampDb, Stats};
pub use device::{Device, DirMetaStore, FileRegion, MemMetaStore, MemRegion, MetaFile, MetaStore, Region};
pub use error::{Result, StampError, Status};
pub use query::{CursorState, QueryCursor};
