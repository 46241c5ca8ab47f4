//! Checkpoint persistence: record types, storage back-ends, and the store.
//!
//! The checkpoint is the unit of atomic progress; all recovery goes through
//! it. The store front door enforces the size cap, id uniqueness, retention,
//! and the primary→file fallback; back-ends only move bytes.

pub mod backend;
pub mod file;
pub mod store;
pub mod types;

pub use backend::{BackendError, MemoryBackend, StorageBackend};
pub use file::FileBackend;
pub use store::{CheckpointStore, StoreError};
pub use types::{
    Checkpoint, CheckpointMetadata, CheckpointStatistics, ValidationReport,
    SNAPSHOT_SCHEMA_VERSION,
};
