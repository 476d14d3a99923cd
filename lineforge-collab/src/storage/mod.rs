//! Persistent storage for the shared snapshot.
//!
//! ```text
//! ┌────────────────┐  save on change  ┌──────────────┐
//! │ snapshot actor │ ───────────────► │ SnapshotDb   │
//! │ (in-memory)    │                  │ (RocksDB)    │
//! └───────┬────────┘                  └──────┬───────┘
//!         │ on startup                       │ column families
//!         ▼                                  ▼
//!  SnapshotHandle::spawn_persistent   CF "snapshots" — bincode + LZ4 state
//!                                     CF "metadata"  — version, sizes
//! ```

pub mod rocks;

pub use rocks::{DbError, SnapshotDb, SnapshotMetadata, StoreConfig};
