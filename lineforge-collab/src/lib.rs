//! # lineforge-collab — Real-time synchronization core for Lineforge
//!
//! A hand-rolled WebSocket transport carrying two application protocols: room
//! collaboration (shared document, cursors, entity locks) and checksum-guarded
//! differential sync of a shared key/value snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   upgrade + frames   ┌──────────────┐
//! │ Browser /   │ ◄──────────────────► │ CollabServer │
//! │ device      │   JSON text frames   │ (accept loop)│
//! └─────────────┘                      └──────┬───────┘
//!                        ┌────────────────────┼─────────────────────┐
//!                        ▼                    ▼                     ▼
//!                 ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//!                 │ RoomManager │     │ PresenceHub  │     │ SyncService  │
//!                 │ (room actor)│     │ (online set) │     │              │
//!                 └─────────────┘     └──────────────┘     └──────┬───────┘
//!                                                                 ▼
//!                                                        ┌────────────────┐
//!                                                        │ SnapshotHandle │
//!                                                        │ (CAS actor)    │
//!                                                        └───────┬────────┘
//!                                                                ▼
//!                                                        SnapshotDb (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`frame`] — WebSocket frame codec
//! - [`handshake`] — HTTP upgrade parsing and the accept token
//! - [`connection`] — Per-connection outbound queue, writer and frame reader
//! - [`broadcast`] — Connection registry with fire-and-forget fan-out
//! - [`protocol`] — Room protocol messages
//! - [`room`] — Room state machine (revisions, locks, presence)
//! - [`collab`] — Room actors and the room connection loop
//! - [`presence`] — Online-identity broadcast variant
//! - [`snapshot`] — Snapshot store, checksum, differential operations
//! - [`sync`] — Differential sync protocol
//! - [`storage`] — RocksDB persistence for the snapshot
//! - [`server`] — Accept loop, routing and the reconcile endpoint

pub mod broadcast;
pub mod collab;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, ConnectionRegistry};
pub use collab::RoomManager;
pub use connection::{ConnectionError, ConnectionHandle, ConnectionId, SendError, WsConnection};
pub use frame::{decode_next_frame, encode_text_frame, Frame, FrameBuffer, FrameError, Opcode};
pub use handshake::{compute_accept_token, HandshakeError};
pub use presence::PresenceHub;
pub use protocol::{ClientMessage, EntityType, LockInfo, ProtocolError, ServerMessage};
pub use room::Room;
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use snapshot::{
    compute_checksum, ApplyOutcome, ApplyStatus, DiffOperation, KeyFilter, ReconcileOutcome,
    ReconcileStatus, Snapshot, SnapshotHandle, SnapshotState, SnapshotStore, StateStore,
    StoreError,
};
pub use storage::{SnapshotDb, StoreConfig};
pub use sync::{SyncClientMessage, SyncServerMessage, SyncService};
