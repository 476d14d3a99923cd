//! Differential snapshot sync over WebSocket.
//!
//! ```text
//! connect ──► sync-welcome (projection)
//! sync-differential{baseChecksum, operations}
//!     ├─ mismatch ─► sync-checksum-mismatch (sender, full state)
//!     ├─ no-op ────► sync-ack (sender)
//!     └─ applied ──► sync-ack (sender) + sync-differential-applied (everyone else)
//! sync-differential-batch{baseChecksum?, diffs} — same contract, one commit
//! ```
//!
//! Broadcasts carry only the applied operations and the new
//! `{version, checksum}`. Requests from all connections take turns between
//! the store call and the fan-out, so peers see applied diffs in version
//! order. A store failure ends the connection so a client is never told a
//! write landed when it did not.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, ConnectionRegistry};
use crate::connection::{ConnectionError, ConnectionId, SendError, WsConnection};
use crate::protocol::{parse_envelope, ProtocolError};
use crate::snapshot::{
    build_projection, snapshot_from_value, version_from_value, ApplyOutcome, ApplyStatus,
    DiffOperation, Snapshot, SnapshotProjection, SnapshotState, StateStore, StateSummary,
    StoreError,
};

/// Messages a sync client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncClientMessage {
    Differential {
        request_id: Value,
        base_checksum: String,
        operations: Vec<DiffOperation>,
    },
    DifferentialBatch {
        request_id: Value,
        base_checksum: Option<String>,
        diffs: Vec<Vec<DiffOperation>>,
    },
}

impl SyncClientMessage {
    pub const TYPES: &'static [&'static str] = &["sync-differential", "sync-differential-batch"];

    /// Parse leniently: malformed operations are skipped rather than failing
    /// the whole message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = parse_envelope(text, Self::TYPES)?;
        let request_id = match value.get("requestId") {
            Some(Value::Null | Value::Bool(false)) | None => Value::Null,
            Some(Value::String(s)) if s.is_empty() => Value::Null,
            Some(other) => other.clone(),
        };
        let base_checksum = value
            .get("baseChecksum")
            .and_then(Value::as_str)
            .map(str::to_string);

        match value.get("type").and_then(Value::as_str) {
            Some("sync-differential") => Ok(Self::Differential {
                request_id,
                base_checksum: base_checksum.unwrap_or_default(),
                operations: value
                    .get("operations")
                    .map(DiffOperation::list_from_value)
                    .unwrap_or_default(),
            }),
            _ => {
                let diffs = value
                    .get("diffs")
                    .and_then(Value::as_array)
                    .map(|diffs| diffs.iter().map(diff_operations).collect())
                    .unwrap_or_default();
                Ok(Self::DifferentialBatch {
                    request_id,
                    base_checksum,
                    diffs,
                })
            }
        }
    }
}

/// A batch entry is either `{operations: [...]}` or a bare operation list.
fn diff_operations(diff: &Value) -> Vec<DiffOperation> {
    match diff {
        Value::Array(_) => DiffOperation::list_from_value(diff),
        _ => diff
            .get("operations")
            .map(DiffOperation::list_from_value)
            .unwrap_or_default(),
    }
}

/// Messages the sync service sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncServerMessage {
    SyncWelcome {
        client_id: Uuid,
        state: SnapshotProjection,
    },
    SyncAck {
        request_id: Value,
        status: ApplyStatus,
        operations: Vec<DiffOperation>,
        state: StateSummary,
    },
    SyncChecksumMismatch {
        request_id: Value,
        state: SnapshotState,
    },
    SyncDifferentialApplied {
        request_id: Value,
        origin_client_id: Uuid,
        operations: Vec<DiffOperation>,
        state: StateSummary,
    },
}

/// Parse a `{version, snapshot}` reconcile body.
pub fn parse_reconcile_request(body: &[u8]) -> Result<(u64, Snapshot), ProtocolError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::MalformedJson("body is not an object".into()));
    }
    let version = version_from_value(value.get("version"));
    let snapshot = value.get("snapshot").map(snapshot_from_value).unwrap_or_default();
    Ok((version, snapshot))
}

/// Errors ending a sync connection.
#[derive(Debug)]
pub enum SyncError {
    Connection(ConnectionError),
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Connection(e) => write!(f, "{e}"),
            SyncError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ConnectionError> for SyncError {
    fn from(e: ConnectionError) -> Self {
        SyncError::Connection(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

/// Sync protocol endpoint over a shared [`StateStore`].
pub struct SyncService {
    store: Arc<dyn StateStore>,
    registry: ConnectionRegistry,
    /// Held from the store call until the fan-out is queued
    commit_order: tokio::sync::Mutex<()>,
}

impl SyncService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            commit_order: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.registry.stats()
    }

    /// Deliver a message to every sync connection.
    pub fn broadcast<T: Serialize>(&self, msg: &T) -> Result<usize, SendError> {
        self.registry.broadcast_json(msg, None)
    }

    /// Run one sync connection until it closes or the store fails.
    pub async fn serve(&self, conn: &mut WsConnection) -> Result<(), SyncError> {
        let id = conn.id();
        self.registry.register(conn.handle().clone());
        log::info!("Sync connection {id} opened");

        let result = self.run(conn).await;

        self.registry.unregister(&id);
        conn.handle().close();
        match &result {
            Err(SyncError::Store(e)) => log::error!("Sync connection {id} terminated: {e}"),
            _ => log::info!("Sync connection {id} closed"),
        }
        result
    }

    async fn run(&self, conn: &mut WsConnection) -> Result<(), SyncError> {
        let id = conn.id();
        let state = self.store.get_state().await?;
        self.send_to(
            &id,
            &SyncServerMessage::SyncWelcome {
                client_id: id,
                state: build_projection(&state),
            },
        );

        while let Some(text) = conn.next_message().await? {
            match SyncClientMessage::parse(&text) {
                Ok(msg) => self.handle(id, msg).await?,
                Err(e) => log::debug!("{id}: dropping sync message: {e}"),
            }
        }
        Ok(())
    }

    /// Apply one client request and fan out the result.
    pub async fn handle(&self, from: ConnectionId, msg: SyncClientMessage) -> Result<(), StoreError> {
        let _turn = self.commit_order.lock().await;
        let (request_id, outcome) = match msg {
            SyncClientMessage::Differential {
                request_id,
                base_checksum,
                operations,
            } => (
                request_id,
                self.store.apply_operations(base_checksum, operations).await?,
            ),
            SyncClientMessage::DifferentialBatch {
                request_id,
                base_checksum,
                diffs,
            } => (
                request_id,
                self.store.apply_operations_batch(base_checksum, diffs).await?,
            ),
        };
        self.respond(from, request_id, outcome);
        Ok(())
    }

    fn respond(&self, from: ConnectionId, request_id: Value, outcome: ApplyOutcome) {
        let ApplyOutcome {
            status,
            state,
            operations,
        } = outcome;

        if status == ApplyStatus::ChecksumMismatch {
            log::debug!("Checksum mismatch from {from}; current {}", state.checksum);
            self.send_to(&from, &SyncServerMessage::SyncChecksumMismatch { request_id, state });
            return;
        }

        let summary = state.summary();
        if status == ApplyStatus::Applied {
            let applied = SyncServerMessage::SyncDifferentialApplied {
                request_id: request_id.clone(),
                origin_client_id: from,
                operations: operations.clone(),
                state: summary.clone(),
            };
            if let Err(e) = self.registry.broadcast_json(&applied, Some(&from)) {
                log::error!("Failed to encode sync broadcast: {e}");
            }
        }
        self.send_to(
            &from,
            &SyncServerMessage::SyncAck {
                request_id,
                status,
                operations,
                state: summary,
            },
        );
    }

    fn send_to(&self, id: &ConnectionId, msg: &SyncServerMessage) {
        let result = crate::connection::encode_json_frame(msg)
            .and_then(|frame| self.registry.send_to(id, frame));
        if let Err(e) = result {
            log::debug!("Sync message to {id} not delivered: {e}");
        }
    }
}
