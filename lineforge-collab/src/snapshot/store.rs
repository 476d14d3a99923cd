//! State-store interface and the actor that serializes access to a snapshot.
//!
//! ```text
//!  sync connections ──┐
//!  HTTP reconcile ────┼── SnapshotHandle ──mpsc──► actor task (owns SnapshotStore)
//!  other callers ─────┘        ▲                         │ persist on change
//!                              └───── oneshot reply ◄────┘
//! ```
//!
//! Every mutating call is a message to one task, so reading the current
//! checksum and writing the new state cannot interleave between callers.
//! When a persistence backend is attached, a change is only kept if it was
//! written; otherwise the previous state is restored and the caller gets a
//! [`StoreError`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{ApplyOutcome, DiffOperation, KeyFilter, ReconcileOutcome, Snapshot, SnapshotState, SnapshotStore};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// State-store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store task is gone
    Unavailable,
    /// Backing storage rejected a read or write
    Persistence(String),
    /// Stored bytes could not be decoded
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable => write!(f, "State store unavailable"),
            StoreError::Persistence(e) => write!(f, "Persistence error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt stored state: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Shared snapshot interface consumed by the sync protocol and usable by any
/// collaborator that reads or writes the snapshot directly.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self) -> Result<SnapshotState, StoreError>;

    async fn reconcile(
        &self,
        version: u64,
        snapshot: Snapshot,
    ) -> Result<ReconcileOutcome, StoreError>;

    async fn apply_operations(
        &self,
        base_checksum: String,
        operations: Vec<DiffOperation>,
    ) -> Result<ApplyOutcome, StoreError>;

    async fn apply_operations_batch(
        &self,
        base_checksum: Option<String>,
        diffs: Vec<Vec<DiffOperation>>,
    ) -> Result<ApplyOutcome, StoreError>;
}

/// Durable backing for a snapshot.
pub trait SnapshotPersistence: Send + Sync + 'static {
    /// Previously saved state, if any.
    fn load(&self) -> Result<Option<SnapshotState>, StoreError>;

    fn save(&self, state: &SnapshotState) -> Result<(), StoreError>;
}

enum Command {
    Get {
        reply: oneshot::Sender<SnapshotState>,
    },
    Reconcile {
        version: u64,
        snapshot: Snapshot,
        reply: oneshot::Sender<Result<ReconcileOutcome, StoreError>>,
    },
    Apply {
        base_checksum: Option<String>,
        operations: Vec<DiffOperation>,
        reply: oneshot::Sender<Result<ApplyOutcome, StoreError>>,
    },
}

/// Cloneable handle to the snapshot actor.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<Command>,
}

impl SnapshotHandle {
    /// In-memory store.
    pub fn spawn(store: SnapshotStore) -> Self {
        Self::start(store, None)
    }

    /// Load the last saved state from `persistence` and keep it updated.
    pub fn spawn_persistent(
        filter: KeyFilter,
        persistence: Arc<dyn SnapshotPersistence>,
    ) -> Result<Self, StoreError> {
        let store = match persistence.load()? {
            Some(saved) => {
                log::info!(
                    "Restored snapshot version {} ({} keys)",
                    saved.version,
                    saved.snapshot.len()
                );
                SnapshotStore::with_state(filter, saved.version, saved.snapshot, saved.updated_at)
            }
            None => SnapshotStore::new(filter),
        };
        Ok(Self::start(store, Some(persistence)))
    }

    fn start(store: SnapshotStore, persistence: Option<Arc<dyn SnapshotPersistence>>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run_actor(store, persistence, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StoreError::Unavailable)?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }
}

#[async_trait]
impl StateStore for SnapshotHandle {
    async fn get_state(&self) -> Result<SnapshotState, StoreError> {
        self.request(|reply| Command::Get { reply }).await
    }

    async fn reconcile(
        &self,
        version: u64,
        snapshot: Snapshot,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.request(|reply| Command::Reconcile {
            version,
            snapshot,
            reply,
        })
        .await?
    }

    async fn apply_operations(
        &self,
        base_checksum: String,
        operations: Vec<DiffOperation>,
    ) -> Result<ApplyOutcome, StoreError> {
        self.request(|reply| Command::Apply {
            base_checksum: Some(base_checksum),
            operations,
            reply,
        })
        .await?
    }

    async fn apply_operations_batch(
        &self,
        base_checksum: Option<String>,
        diffs: Vec<Vec<DiffOperation>>,
    ) -> Result<ApplyOutcome, StoreError> {
        self.request(|reply| Command::Apply {
            base_checksum,
            operations: diffs.into_iter().flatten().collect(),
            reply,
        })
        .await?
    }
}

async fn run_actor(
    mut store: SnapshotStore,
    persistence: Option<Arc<dyn SnapshotPersistence>>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Get { reply } => {
                let _ = reply.send(store.state().clone());
            }
            Command::Reconcile {
                version,
                snapshot,
                reply,
            } => {
                let before = store.state().clone();
                let outcome = store.reconcile(version, snapshot);
                let result = if outcome.changed() {
                    commit(&mut store, persistence.as_ref(), before)
                        .await
                        .map(|()| outcome)
                } else {
                    Ok(outcome)
                };
                let _ = reply.send(result);
            }
            Command::Apply {
                base_checksum,
                operations,
                reply,
            } => {
                let before = store.state().clone();
                let outcome = match base_checksum.as_deref() {
                    Some(base) => store.apply_operations(base, &operations),
                    None => store.apply_operations_batch(None, &[operations]),
                };
                let result = if outcome.changed() {
                    commit(&mut store, persistence.as_ref(), before)
                        .await
                        .map(|()| outcome)
                } else {
                    Ok(outcome)
                };
                let _ = reply.send(result);
            }
        }
    }
    log::debug!("Snapshot store task stopped");
}

/// Persist the current state, restoring `before` if the write fails.
async fn commit(
    store: &mut SnapshotStore,
    persistence: Option<&Arc<dyn SnapshotPersistence>>,
    before: SnapshotState,
) -> Result<(), StoreError> {
    let Some(persistence) = persistence else {
        return Ok(());
    };
    let backend = persistence.clone();
    let state = store.state().clone();
    let saved = tokio::task::spawn_blocking(move || backend.save(&state))
        .await
        .map_err(|e| StoreError::Persistence(e.to_string()))
        .and_then(|r| r);

    if let Err(e) = &saved {
        log::error!("Failed to persist snapshot version {}: {e}", store.state().version);
        store.restore(before);
    }
    saved
}
