//! Storage device: the byte-addressable log region plus the small metadata
//! artifacts (two snapshot slots and the head hint).
//!
//! Each artifact is persisted independently, so a crash while writing one of
//! them leaves the previous generation of the others intact.
//!
//! # Example
//!
//! ```rust,ignore
//! use stampdb::device::Device;
//! use stampdb::SyncMode;
//!
//! // File-backed device: flash.bin plus meta_*.bin next to it
//! let device = Device::open_dir("/var/lib/stamp", 256 * 1024)?;
//!
//! // Volatile device for tests and simulation
//! let device = Device::in_memory(64 * 1024);
//! ```

use crate::config::SyncMode;
use crate::error::{Result, StampError};
use crate::log::page::SEGMENT_BYTES;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte value of erased media.
pub const ERASED: u8 = 0xFF;

/// Log region file name inside a device directory.
pub const REGION_FILE: &str = "flash.bin";

/// A byte-addressable storage region of fixed size.
///
/// Writes that have not been synced may be lost on a crash.
pub trait Region: Send {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Makes previous writes durable according to `mode`.
    fn sync(&mut self, mode: SyncMode) -> io::Result<()>;
}

fn check_bounds(size: u64, offset: u64, len: usize) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access {}+{} beyond region of {} bytes", offset, len, size),
        )),
    }
}

/// In-memory region, initially erased.
#[derive(Debug, Clone)]
pub struct MemRegion {
    bytes: Vec<u8>,
}

impl MemRegion {
    /// Creates an erased region of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![ERASED; size],
        }
    }

    /// Raw view of the region contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Region for MemRegion {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.size(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.size(), offset, data.len())?;
        let start = offset as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self, _mode: SyncMode) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed region of a fixed, preallocated size.
#[derive(Debug)]
pub struct FileRegion {
    file: File,
    size: u64,
}

impl FileRegion {
    /// Opens `path`, creating and erasing it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if an existing file has a different size.
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing = file.metadata()?.len();
        if existing == 0 {
            let erased = [ERASED; SEGMENT_BYTES];
            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(SEGMENT_BYTES as u64) as usize;
                file.write_all(&erased[..n])?;
                remaining -= n as u64;
            }
            file.sync_all()?;
        } else if existing != size {
            return Err(StampError::invalid(format!(
                "region file {} is {} bytes, expected {}",
                path.display(),
                existing,
                size
            )));
        }

        Ok(Self { file, size })
    }
}

impl Region for FileRegion {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.size, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.size, offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn sync(&mut self, mode: SyncMode) -> io::Result<()> {
        mode.apply(&self.file)
    }
}

/// The metadata artifacts kept beside the log region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaFile {
    /// Snapshot slot A.
    SnapshotA,
    /// Snapshot slot B.
    SnapshotB,
    /// Last known write position.
    HeadHint,
}

impl MetaFile {
    /// File name used by [`DirMetaStore`].
    pub fn file_name(self) -> &'static str {
        match self {
            MetaFile::SnapshotA => "meta_snap_a.bin",
            MetaFile::SnapshotB => "meta_snap_b.bin",
            MetaFile::HeadHint => "meta_head_hint.bin",
        }
    }

    fn slot(self) -> usize {
        match self {
            MetaFile::SnapshotA => 0,
            MetaFile::SnapshotB => 1,
            MetaFile::HeadHint => 2,
        }
    }
}

/// Store for small, atomically replaced metadata records.
pub trait MetaStore: Send {
    /// Loads a record, or `None` if it has never been written.
    fn load(&mut self, file: MetaFile) -> io::Result<Option<Vec<u8>>>;

    /// Atomically replaces a record.
    fn store(&mut self, file: MetaFile, bytes: &[u8], mode: SyncMode) -> io::Result<()>;
}

/// Volatile metadata store.
#[derive(Debug, Clone, Default)]
pub struct MemMetaStore {
    records: [Option<Vec<u8>>; 3],
}

impl MemMetaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemMetaStore {
    fn load(&mut self, file: MetaFile) -> io::Result<Option<Vec<u8>>> {
        Ok(self.records[file.slot()].clone())
    }

    fn store(&mut self, file: MetaFile, bytes: &[u8], _mode: SyncMode) -> io::Result<()> {
        self.records[file.slot()] = Some(bytes.to_vec());
        Ok(())
    }
}

/// Metadata store keeping one file per record in a directory.
///
/// Records are written to `<name>.tmp`, synced, then renamed over the old
/// file.
#[derive(Debug, Clone)]
pub struct DirMetaStore {
    dir: PathBuf,
}

impl DirMetaStore {
    /// Uses `dir` for metadata files, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of a metadata record.
    pub fn path_of(&self, file: MetaFile) -> PathBuf {
        self.dir.join(file.file_name())
    }
}

impl MetaStore for DirMetaStore {
    fn load(&mut self, file: MetaFile) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(file)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&mut self, file: MetaFile, bytes: &[u8], mode: SyncMode) -> io::Result<()> {
        let target = self.path_of(file);
        let tmp = target.with_extension("bin.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(bytes)?;
            mode.apply(&out)?;
        }
        fs::rename(&tmp, &target)
    }
}

/// A log region together with its metadata store.
pub struct Device {
    region: Box<dyn Region>,
    meta: Box<dyn MetaStore>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("region_bytes", &self.region.size())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Combines an arbitrary region and metadata store.
    pub fn new(region: impl Region + 'static, meta: impl MetaStore + 'static) -> Self {
        Self {
            region: Box::new(region),
            meta: Box::new(meta),
        }
    }

    /// Creates a volatile device with an erased region of `region_bytes`.
    pub fn in_memory(region_bytes: usize) -> Self {
        Self::new(MemRegion::new(region_bytes), MemMetaStore::new())
    }

    /// Opens (or creates) a file-backed device in `dir`.
    pub fn open_dir(dir: impl AsRef<Path>, region_bytes: u64) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = DirMetaStore::new(dir)?;
        let region = FileRegion::open(dir.join(REGION_FILE), region_bytes)?;
        Ok(Self::new(region, meta))
    }

    /// Raw access to the log region, e.g. for fault injection.
    pub fn region_mut(&mut self) -> &mut dyn Region {
        self.region.as_mut()
    }

    /// Raw access to the metadata store.
    pub fn meta_mut(&mut self) -> &mut dyn MetaStore {
        self.meta.as_mut()
    }

    /// Size of the log region in bytes.
    pub fn region_bytes(&self) -> u64 {
        self.region.size()
    }

    pub(crate) fn into_parts(self) -> (Box<dyn Region>, Box<dyn MetaStore>) {
        (self.region, self.meta)
    }

    pub(crate) fn from_parts(region: Box<dyn Region>, meta: Box<dyn MetaStore>) -> Self {
        Self { region, meta }
    }
}
