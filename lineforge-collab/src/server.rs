//! TCP accept loop, upgrade routing and the sync REST endpoint.
//!
//! Architecture:
//! ```text
//!                      ┌──────────── …/ws/lineforge ───────► RoomManager ── Room actors
//! TcpListener ── head ─┼──────────── …/ws/crew-presence ───► PresenceHub
//!   (accept)     │     └──────────── …/ws/localstorage-sync ► SyncService ─┐
//!                │                                                         ▼
//!                └── plain HTTP …/api/localstorage-sync ──────────► StateStore (actor)
//!                                                                          │
//!                                                                          ▼
//!                                                                  SnapshotDb (RocksDB)
//! ```
//!
//! Every accepted socket gets its own task. The task reads the request head,
//! either answers a plain HTTP request or completes the upgrade, spawns the
//! outbound writer and hands the inbound side to the matching service.
//! Connection errors are logged in the task and never reach the accept loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use uuid::Uuid;

use crate::collab::RoomManager;
use crate::connection::{run_writer, ConnectionError, ConnectionHandle, WsConnection};
use crate::handshake::{
    find_head_end, json_response, path_matches, status_response, switching_protocols_response,
    HandshakeError, RequestHead,
};
use crate::presence::PresenceHub;
use crate::snapshot::{KeyFilter, SnapshotHandle, SnapshotStore, StateStore, StoreError};
use crate::storage::{DbError, SnapshotDb, StoreConfig};
use crate::sync::{parse_reconcile_request, SyncError, SyncService};

const READ_CHUNK: usize = 4096;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room used when the `room` query parameter is absent
    pub default_room: String,
    /// Path suffix of the room protocol
    pub collab_path: String,
    /// Path suffix of the presence variant
    pub presence_path: String,
    /// Path suffix of the differential sync protocol
    pub sync_path: String,
    /// Path suffix of the plain HTTP reconcile endpoint
    pub sync_api_path: String,
    /// Frames queued per connection before sends are dropped
    pub outbound_queue_capacity: usize,
    /// Largest accepted frame payload (and HTTP body)
    pub max_frame_bytes: u64,
    /// Largest accepted request head
    pub max_head_bytes: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Close connections that stay silent this long (None = never)
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            default_room: "default".to_string(),
            collab_path: "/ws/lineforge".to_string(),
            presence_path: "/ws/crew-presence".to_string(),
            sync_path: "/ws/localstorage-sync".to_string(),
            sync_api_path: "/api/localstorage-sync".to_string(),
            outbound_queue_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            max_head_bytes: 16 * 1024,
            storage_path: None,
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `LINEFORGE_*` (and `HOST`/`PORT`) variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through `lookup`. Unparsable values are logged
    /// and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = lookup("LINEFORGE_BIND").filter(|v| !v.trim().is_empty()) {
            config.bind_addr = bind.trim().to_string();
        } else {
            let host = lookup("HOST").filter(|v| !v.trim().is_empty());
            let port = lookup("PORT").and_then(|v| parse_var::<u16>("PORT", &v));
            if host.is_some() || port.is_some() {
                config.bind_addr = format!(
                    "{}:{}",
                    host.as_deref().map(str::trim).unwrap_or("127.0.0.1"),
                    port.unwrap_or(3000)
                );
            }
        }

        if let Some(path) = lookup("LINEFORGE_STORAGE_PATH").filter(|v| !v.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(secs) = lookup("LINEFORGE_IDLE_TIMEOUT_SECS")
            .and_then(|v| parse_var::<u64>("LINEFORGE_IDLE_TIMEOUT_SECS", &v))
        {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(max) = lookup("LINEFORGE_MAX_FRAME_BYTES")
            .and_then(|v| parse_var::<u64>("LINEFORGE_MAX_FRAME_BYTES", &v))
        {
            config.max_frame_bytes = max;
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {name}={value:?}: not a valid value");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub http_requests: u64,
    pub frames_received: u64,
    pub messages_broadcast: u64,
    pub sends_dropped: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    http_requests: AtomicU64,
    frames_received: AtomicU64,
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Handshake(HandshakeError),
    Connection(ConnectionError),
    Store(StoreError),
    Storage(DbError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
            ServerError::Handshake(e) => write!(f, "Handshake rejected: {e}"),
            ServerError::Connection(e) => write!(f, "{e}"),
            ServerError::Store(e) => write!(f, "{e}"),
            ServerError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<HandshakeError> for ServerError {
    fn from(e: HandshakeError) -> Self {
        ServerError::Handshake(e)
    }
}

impl From<ConnectionError> for ServerError {
    fn from(e: ConnectionError) -> Self {
        ServerError::Connection(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

impl From<DbError> for ServerError {
    fn from(e: DbError) -> Self {
        ServerError::Storage(e)
    }
}

impl From<SyncError> for ServerError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Connection(e) => ServerError::Connection(e),
            SyncError::Store(e) => ServerError::Store(e),
        }
    }
}

/// Upgrade target resolved from the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Room {
        key: String,
        crew_member_id: Option<String>,
    },
    Presence,
    Sync,
}

struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    presence: PresenceHub,
    sync: SyncService,
    counters: Counters,
}

/// The collaboration server. Cheap to clone; clones share every service.
#[derive(Clone)]
pub struct CollabServer {
    shared: Arc<Shared>,
}

impl CollabServer {
    /// Create a server over an existing state store.
    pub fn new(config: ServerConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RoomManager::new(),
                presence: PresenceHub::new(),
                sync: SyncService::new(store),
                counters: Counters::default(),
            }),
        }
    }

    /// Create with an in-memory snapshot. Must be called inside a runtime.
    pub fn in_memory(config: ServerConfig) -> Self {
        let store = SnapshotHandle::spawn(SnapshotStore::default());
        Self::new(config, Arc::new(store))
    }

    /// Create with the snapshot persisted at `config.storage_path`, or in
    /// memory when no path is configured. Must be called inside a runtime.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let Some(path) = config.storage_path.clone() else {
            return Ok(Self::in_memory(config));
        };
        let db = SnapshotDb::open(StoreConfig::at(path))?;
        log::info!("Snapshot storage opened at {}", db.path().display());
        let store = SnapshotHandle::spawn_persistent(KeyFilter::default(), Arc::new(db))?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.shared.rooms
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.shared.presence
    }

    pub fn sync(&self) -> &SyncService {
        &self.shared.sync
    }

    /// The shared snapshot, for collaborators that bypass the transport.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        self.shared.sync.store()
    }

    /// Get current server statistics.
    pub fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        let services = [
            self.shared.rooms.stats(),
            self.shared.presence.stats(),
            self.shared.sync.stats(),
        ];
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: counters.rejected_handshakes.load(Ordering::Relaxed),
            http_requests: counters.http_requests.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            messages_broadcast: services.iter().map(|s| s.messages_sent).sum(),
            sends_dropped: services.iter().map(|s| s.messages_dropped).sum(),
            active_rooms: self.shared.rooms.room_count(),
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Lineforge server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            self.shared.counters.total_connections.fetch_add(1, Ordering::Relaxed);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    match e {
                        ServerError::Store(_) | ServerError::Storage(_) => {
                            log::error!("Connection from {addr} failed: {e}")
                        }
                        _ => log::debug!("Connection from {addr} ended: {e}"),
                    }
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let config = &self.shared.config;
        let (head, rest) = match read_head(&mut stream, config.max_head_bytes).await {
            Ok(Some(parts)) => parts,
            Ok(None) => return Ok(()),
            Err(ServerError::Handshake(e)) => return self.reject(stream, e).await,
            Err(e) => return Err(e),
        };

        let request = match RequestHead::parse(&head) {
            Ok(request) => request,
            Err(e) => return self.reject(stream, e).await,
        };
        let url = match request.url() {
            Ok(url) => url,
            Err(e) => return self.reject(stream, e).await,
        };

        // WebSocket paths only speak the upgrade; a bad upgrade there is a 400.
        let Some(route) = self.route(&url) else {
            if !request.wants_upgrade() {
                return self.handle_http(stream, &request, &url, rest).await;
            }
            log::debug!("No upgrade route for {} from {addr}", url.path());
            stream.write_all(status_response(404, "Not Found").as_bytes()).await?;
            return Ok(());
        };
        let token = match request.accept_websocket() {
            Ok(token) => token,
            Err(e) => return self.reject(stream, e).await,
        };
        stream
            .write_all(switching_protocols_response(&token).as_bytes())
            .await?;

        let (reader, writer) = stream.into_split();
        let (handle, outbound) = ConnectionHandle::new(Uuid::new_v4(), config.outbound_queue_capacity);
        let writer_task = tokio::spawn(run_writer(writer, outbound, handle.closed_signal()));
        let mut conn = WsConnection::new(
            reader,
            handle.clone(),
            &rest,
            config.max_frame_bytes,
            config.idle_timeout,
        );

        if conn.prebuffered_close() {
            log::debug!("Connection {} from {addr} closed during handshake", conn.id());
            handle.close();
            let _ = writer_task.await;
            return Ok(());
        }

        let counters = &self.shared.counters;
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        let result: Result<(), ServerError> = match route {
            Route::Room {
                key,
                crew_member_id,
            } => self
                .shared
                .rooms
                .serve(&mut conn, &key, crew_member_id)
                .await
                .map_err(Into::into),
            Route::Presence => self.shared.presence.serve(&mut conn).await.map_err(Into::into),
            Route::Sync => self.shared.sync.serve(&mut conn).await.map_err(Into::into),
        };
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        counters
            .frames_received
            .fetch_add(conn.frames_received(), Ordering::Relaxed);

        handle.close();
        let _ = writer_task.await;
        result
    }

    fn route(&self, url: &Url) -> Option<Route> {
        let config = &self.shared.config;
        let path = url.path();
        if path_matches(path, &config.collab_path) {
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };
            let room = param("room").unwrap_or_else(|| config.default_room.clone());
            let key = match param("projectId") {
                Some(project) => format!("{project}:{room}"),
                None => room,
            };
            Some(Route::Room {
                key,
                crew_member_id: param("crewMemberId"),
            })
        } else if path_matches(path, &config.presence_path) {
            Some(Route::Presence)
        } else if path_matches(path, &config.sync_path) {
            Some(Route::Sync)
        } else {
            None
        }
    }

    async fn handle_http(
        &self,
        mut stream: TcpStream,
        request: &RequestHead,
        url: &Url,
        mut body: Vec<u8>,
    ) -> Result<(), ServerError> {
        let config = &self.shared.config;
        if !path_matches(url.path(), &config.sync_api_path) {
            stream.write_all(status_response(404, "Not Found").as_bytes()).await?;
            return Ok(());
        }
        self.shared.counters.http_requests.fetch_add(1, Ordering::Relaxed);
        let store = self.shared.sync.store();

        let response = match request.method.as_str() {
            "GET" => {
                let state = store.get_state().await?;
                json_response(200, "OK", &to_json(&state)?)
            }
            "POST" => {
                let length = request.content_length();
                if length as u64 > config.max_frame_bytes {
                    status_response(413, "Payload Too Large")
                } else {
                    read_body(&mut stream, &mut body, length).await?;
                    match parse_reconcile_request(&body) {
                        Ok((version, snapshot)) => {
                            let outcome = store.reconcile(version, snapshot).await?;
                            log::info!(
                                "HTTP reconcile v{version}: {:?} (server v{})",
                                outcome.status,
                                outcome.state.version
                            );
                            json_response(200, "OK", &to_json(&outcome)?)
                        }
                        Err(e) => {
                            log::debug!("Rejecting reconcile body: {e}");
                            status_response(400, "Bad Request")
                        }
                    }
                }
            }
            _ => status_response(405, "Method Not Allowed"),
        };
        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }

    async fn reject(&self, mut stream: TcpStream, error: HandshakeError) -> Result<(), ServerError> {
        self.shared.counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
        let (code, reason) = error.status();
        stream.write_all(status_response(code, reason).as_bytes()).await?;
        Err(error.into())
    }
}

/// Read up to the end of the request head. Returns the head and whatever
/// followed it, or `None` when the peer closed before sending anything.
async fn read_head(
    stream: &mut TcpStream,
    max_head: usize,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, ServerError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > max_head {
            return Err(HandshakeError::HeadTooLarge(max_head).into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HandshakeError::Malformed("connection closed inside request head".into()).into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_body(stream: &mut TcpStream, body: &mut Vec<u8>, length: usize) -> Result<(), ServerError> {
    let mut chunk = [0u8; READ_CHUNK];
    while body.len() < length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(length);
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServerError> {
    serde_json::to_string(value).map_err(|e| ServerError::Store(StoreError::Corrupt(e.to_string())))
}
