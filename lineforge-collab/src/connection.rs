//! Per-connection transport: an outbound handle, a writer task, and a
//! frame-reading inbound side.
//!
//! ```text
//!  services ── ConnectionHandle::send ──► bounded queue ──► writer task ──► socket
//!                                                                   ▲
//!  socket ──► WsConnection::next_message ──► text payloads          │
//!                    │ ping ─────────────── pong ───────────────────┘
//! ```
//!
//! Sends never block: a full queue drops the message for that peer only, so
//! one slow client cannot stall delivery to the rest.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::frame::{self, FrameBuffer, FrameError, Opcode};

/// Identifier assigned to a connection after a successful handshake.
pub type ConnectionId = Uuid;

const READ_CHUNK: usize = 8 * 1024;

/// Why an outbound message was not queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The peer's queue is full; the message was dropped
    Full,
    /// The connection is closed
    Closed,
    /// The message could not be serialized
    Encode(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Full => write!(f, "Outbound queue full"),
            SendError::Closed => write!(f, "Connection closed"),
            SendError::Encode(e) => write!(f, "Encode error: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Serialize a message to JSON and wrap it in a text frame.
///
/// Broadcasts encode once and share the bytes between recipients.
pub fn encode_json_frame<T: Serialize>(msg: &T) -> Result<Arc<Vec<u8>>, SendError> {
    let text = serde_json::to_string(msg).map_err(|e| SendError::Encode(e.to_string()))?;
    Ok(Arc::new(frame::encode_text_frame(&text)))
}

/// Cloneable sending side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Create a handle and the queue receiver its writer task drains.
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        (
            Self {
                id,
                outbound,
                closed: Arc::new(closed),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue pre-encoded frame bytes.
    pub fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Serialize and queue a JSON message.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<(), SendError> {
        self.send(encode_json_frame(msg)?)
    }

    /// Signal both the writer and the reader to stop.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Drain a connection's outbound queue into the socket until closed.
pub async fn run_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Arc<Vec<u8>>>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if *closed.borrow() {
            break;
        }
        tokio::select! {
            msg = outbound.recv() => {
                let Some(bytes) = msg else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    log::debug!("Write failed, stopping writer: {e}");
                    break;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    outbound.close();
    let _ = writer.shutdown().await;
}

/// Errors ending a connection's read side.
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Frame(FrameError),
    IdleTimeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {e}"),
            ConnectionError::Frame(e) => write!(f, "Frame error: {e}"),
            ConnectionError::IdleTimeout => write!(f, "Connection idle timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}

/// Inbound side of an upgraded connection.
pub struct WsConnection {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    frames: FrameBuffer,
    handle: ConnectionHandle,
    closed: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
    frames_received: u64,
}

impl WsConnection {
    /// Wrap a reader. `prebuffered` holds bytes that arrived with the
    /// handshake and are decoded before anything else is read.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        handle: ConnectionHandle,
        prebuffered: &[u8],
        max_payload: u64,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let mut frames = FrameBuffer::new(max_payload);
        frames.extend(prebuffered);
        let closed = handle.closed_signal();
        Self {
            reader: Box::new(reader),
            frames,
            handle,
            closed,
            idle_timeout,
            frames_received: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Whether the handshake-adjacent bytes already contain a close frame.
    pub fn prebuffered_close(&self) -> bool {
        let mut scan = FrameBuffer::new(u64::MAX);
        scan.extend(self.frames.buffered());
        while let Ok(Some(frame)) = scan.next_frame() {
            if frame.opcode == Opcode::Close {
                return true;
            }
        }
        false
    }

    /// Next text payload, or `Ok(None)` once the peer closed.
    ///
    /// Pings are answered, other non-text frames and invalid UTF-8 are
    /// skipped.
    pub async fn next_message(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            while let Some(frame) = self.frames.next_frame()? {
                self.frames_received += 1;
                match frame.opcode {
                    Opcode::Close => return Ok(None),
                    Opcode::Ping => {
                        let pong = frame::encode_frame(Opcode::Pong, &frame.payload);
                        let _ = self.handle.send(Arc::new(pong));
                    }
                    Opcode::Text => match String::from_utf8(frame.payload) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => log::debug!("Dropping non UTF-8 text frame on {}", self.id()),
                    },
                    other => log::trace!("Ignoring {other:?} frame on {}", self.id()),
                }
            }

            if self.handle.is_closed() {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = self.read_chunk(&mut chunk).await?;
            match read {
                Some(0) | None => return Ok(None),
                Some(n) => self.frames.extend(&chunk[..n]),
            }
        }
    }

    /// Read once, honouring the idle timeout and the close signal.
    /// `None` means the handle was closed locally.
    async fn read_chunk(&mut self, chunk: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
        let reader = &mut self.reader;
        let closed = &mut self.closed;
        let idle_timeout = self.idle_timeout;

        let read = async {
            match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, reader.read(chunk))
                    .await
                    .map_err(|_| ConnectionError::IdleTimeout)?
                    .map_err(ConnectionError::from),
                None => reader.read(chunk).await.map_err(ConnectionError::from),
            }
        };
        let close_requested = async {
            let _ = closed.wait_for(|closed| *closed).await;
        };

        tokio::select! {
            n = read => n.map(Some),
            _ = close_requested => Ok(None),
        }
    }
}
