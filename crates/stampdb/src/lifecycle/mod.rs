//! Log lifecycle: segment reclamation, index snapshots and mount-time
//! recovery.

pub mod gc;
pub mod recovery;
pub mod snapshot;

pub use gc::GarbageCollector;
pub use recovery::{recover, RecoveryReport};
pub use snapshot::{HeadHint, Snapshot, SnapshotStore, SNAPSHOT_BASE_BYTES, SNAPSHOT_ENTRY_BYTES};
