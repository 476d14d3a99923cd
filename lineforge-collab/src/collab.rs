//! Room collaboration service.
//!
//! Each room is an actor: one tokio task owns the [`Room`] state and applies
//! commands from an unbounded channel in arrival order, so revision checks
//! and lock decisions within a room never interleave. Rooms run independently
//! of each other.
//!
//! ```text
//!  connection task ──Join/Message/Leave──► room task (owns Room)
//!        │                                     │ Outbox, roster
//!        │ cursor                              ▼
//!        └───────────────────────► ConnectionRegistry::send_many
//! ```
//!
//! Cursor updates are relayed straight from the connection task using the
//! roster the room task publishes after each join and leave, so a burst of
//! cursor traffic never queues ahead of state or lock requests.
//!
//! Rooms are created lazily on the first join and removed once the last member
//! leaves. Joins are enqueued while holding the room table lock, and a room
//! only removes itself from the table (under the same lock) when its queue is
//! empty, so a join can never land in a room that is shutting down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastStats, ConnectionRegistry};
use crate::connection::{encode_json_frame, ConnectionError, ConnectionId, SendError, WsConnection};
use crate::protocol::{now_millis, ClientMessage, CursorPosition, ProtocolError, ServerMessage};
use crate::room::{Delivery, Recipient, Room};

/// Commands processed by a room task.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        id: ConnectionId,
        crew_member_id: Option<String>,
    },
    Message {
        from: ConnectionId,
        msg: ClientMessage,
    },
    Leave {
        id: ConnectionId,
    },
}

/// Member ids and colors of one room.
type Roster = Arc<RwLock<Vec<(ConnectionId, String)>>>;

struct RoomEntry {
    tx: mpsc::UnboundedSender<RoomCommand>,
    roster: Roster,
}

type RoomTable = Arc<Mutex<HashMap<String, RoomEntry>>>;

/// Owns every live room and the connections joined to them.
pub struct RoomManager {
    rooms: RoomTable,
    registry: Arc<ConnectionRegistry>,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn has_room(&self, key: &str) -> bool {
        self.rooms.lock().contains_key(key)
    }

    /// Connections currently joined to any room.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.registry.stats()
    }

    /// Deliver a message to every connection in every room.
    pub fn broadcast_global<T: Serialize>(&self, msg: &T) -> Result<usize, SendError> {
        self.registry.broadcast_json(msg, None)
    }

    /// Enqueue a join, spawning the room task if the room does not exist.
    fn join(
        &self,
        key: &str,
        id: ConnectionId,
        crew_member_id: Option<String>,
    ) -> (mpsc::UnboundedSender<RoomCommand>, Roster) {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(key.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let roster = Roster::default();
            log::info!("Room {key} created");
            tokio::spawn(run_room(
                key.to_string(),
                rx,
                roster.clone(),
                self.rooms.clone(),
                self.registry.clone(),
            ));
            RoomEntry { tx, roster }
        });
        // The receiver is only dropped after the entry is removed under this lock.
        let _ = entry.tx.send(RoomCommand::Join { id, crew_member_id });
        (entry.tx.clone(), entry.roster.clone())
    }

    /// Run one room connection until it closes.
    ///
    /// The connection's handle is registered before the join so the welcome
    /// can be delivered, and every exit path leaves the room.
    pub async fn serve(
        &self,
        conn: &mut WsConnection,
        room_key: &str,
        crew_member_id: Option<String>,
    ) -> Result<(), ConnectionError> {
        let id = conn.id();
        self.registry.register(conn.handle().clone());
        let (tx, roster) = self.join(room_key, id, crew_member_id);
        log::info!("Connection {id} joined room {room_key}");

        let result = loop {
            match conn.next_message().await {
                Ok(Some(text)) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Cursor { cursor }) => {
                        relay_cursor(&roster, &self.registry, id, &cursor);
                    }
                    Ok(msg) => {
                        if tx.send(RoomCommand::Message { from: id, msg }).is_err() {
                            break Ok(());
                        }
                    }
                    Err(e @ ProtocolError::UnknownType(_)) => log::debug!("{id}: {e}"),
                    Err(e) => log::debug!("{id}: dropping message: {e}"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let _ = tx.send(RoomCommand::Leave { id });
        self.registry.unregister(&id);
        conn.handle().close();
        log::info!("Connection {id} left room {room_key}");
        result
    }
}

/// Send a cursor update to every other member of the room. Cursors from
/// connections the room has not admitted yet are dropped.
fn relay_cursor(roster: &Roster, registry: &ConnectionRegistry, from: ConnectionId, cursor: &Value) {
    let members = roster.read();
    let Some((_, color)) = members.iter().find(|(id, _)| *id == from) else {
        return;
    };
    let message = ServerMessage::Cursor {
        client_id: from,
        color: color.clone(),
        cursor: CursorPosition::from_value(cursor),
        at: now_millis(),
    };
    match encode_json_frame(&message) {
        Ok(frame) => {
            let others = members.iter().map(|(id, _)| id).filter(|id| **id != from);
            registry.send_many(others, &frame);
        }
        Err(e) => log::error!("Failed to encode cursor from {from}: {e}"),
    }
}

async fn run_room(
    key: String,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    roster: Roster,
    rooms: RoomTable,
    registry: Arc<ConnectionRegistry>,
) {
    let mut room = Room::new(key.clone());

    while let Some(cmd) = rx.recv().await {
        let membership_changed = !matches!(cmd, RoomCommand::Message { .. });
        let outbox = match cmd {
            RoomCommand::Join { id, crew_member_id } => room.join(id, crew_member_id),
            RoomCommand::Message { from, msg } => room.handle(from, msg),
            RoomCommand::Leave { id } => room.leave(&id),
        };
        if membership_changed {
            *roster.write() = room.members().iter().map(|m| (m.id, m.color.clone())).collect();
        }
        deliver(&room, &registry, outbox);

        if room.is_empty() {
            let mut rooms = rooms.lock();
            if rx.is_empty() {
                rooms.remove(&key);
                log::info!("Room {key} closed");
                break;
            }
        }
    }
}

fn deliver(room: &Room, registry: &ConnectionRegistry, outbox: Vec<Delivery>) {
    for Delivery { to, message } in outbox {
        let frame = match encode_json_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} for room {}: {e}", message.kind(), room.key());
                continue;
            }
        };
        match to {
            Recipient::One(id) => {
                let _ = registry.send_to(&id, frame);
            }
            Recipient::AllExcept(except) => {
                let targets = room.members().iter().map(|m| &m.id).filter(|id| **id != except);
                registry.send_many(targets, &frame);
            }
            Recipient::All => {
                registry.send_many(room.members().iter().map(|m| &m.id), &frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::frame::{decode_next_frame, encode_masked_frame, Opcode};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use uuid::Uuid;

    struct TestClient {
        id: ConnectionId,
        input: DuplexStream,
        rx: mpsc::Receiver<Arc<Vec<u8>>>,
    }

    impl TestClient {
        async fn send(&mut self, value: Value) {
            let bytes = encode_masked_frame(Opcode::Text, value.to_string().as_bytes(), [7, 3, 1, 9]);
            self.input.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let bytes = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("queue closed");
            let (frame, _) = decode_next_frame(&bytes).unwrap().unwrap();
            serde_json::from_str(frame.text().unwrap()).unwrap()
        }
    }

    fn connect(manager: &Arc<RoomManager>, room: &str) -> (TestClient, tokio::task::JoinHandle<()>) {
        let (input, server_side) = tokio::io::duplex(4096);
        let id = Uuid::new_v4();
        let (handle, rx) = ConnectionHandle::new(id, 64);
        let mut conn = WsConnection::new(server_side, handle, &[], 1 << 20, None);
        let manager = manager.clone();
        let room = room.to_string();
        let task = tokio::spawn(async move {
            let _ = manager.serve(&mut conn, &room, None).await;
        });
        (TestClient { id, input, rx }, task)
    }

    #[tokio::test]
    async fn test_state_round_trip_through_room_task() {
        let manager = Arc::new(RoomManager::new());
        let (mut a, _ta) = connect(&manager, "alpha");
        assert_eq!(a.recv().await["type"], "welcome");
        let (mut b, _tb) = connect(&manager, "alpha");
        assert_eq!(b.recv().await["type"], "welcome");
        assert_eq!(a.recv().await["type"], "peer-joined");

        a.send(serde_json::json!({"type": "state", "requestId": "s1", "baseRevision": 0, "state": {"v": 1}})).await;
        let ack = a.recv().await;
        assert_eq!(ack["type"], "state-ack");
        assert_eq!(ack["revision"], 1);
        let update = b.recv().await;
        assert_eq!(update["type"], "state");
        assert_eq!(update["clientId"], a.id.to_string());
        assert_eq!(update["state"]["v"], 1);
    }

    #[tokio::test]
    async fn test_cursor_relayed_to_others_with_color() {
        let manager = Arc::new(RoomManager::new());
        let (mut a, _ta) = connect(&manager, "alpha");
        let color = a.recv().await["color"].clone();
        let (mut b, _tb) = connect(&manager, "alpha");
        b.recv().await;
        a.recv().await; // peer-joined

        a.send(serde_json::json!({"type": "cursor", "cursor": {"x": 3, "y": "4.5"}})).await;
        let cursor = b.recv().await;
        assert_eq!(cursor["type"], "cursor");
        assert_eq!(cursor["clientId"], a.id.to_string());
        assert_eq!(cursor["color"], color);
        assert_eq!(cursor["cursor"]["x"], 3.0);
        assert_eq!(cursor["cursor"]["y"], 4.5);

        // The sender never hears its own cursor; its next message is the ack.
        a.send(serde_json::json!({"type": "state", "baseRevision": 0, "state": 1})).await;
        assert_eq!(a.recv().await["type"], "state-ack");
    }

    #[test]
    fn test_cursor_from_unadmitted_connection_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (member, mut member_rx) = ConnectionHandle::new(Uuid::new_v4(), 8);
        let member_id = member.id();
        registry.register(member);
        let roster: Roster = Arc::new(RwLock::new(vec![(member_id, "#ff4d4f".to_string())]));

        relay_cursor(&roster, &registry, Uuid::new_v4(), &serde_json::json!({"x": 1, "y": 1}));
        assert!(member_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated_and_removed_when_empty() {
        let manager = Arc::new(RoomManager::new());
        let (mut a, ta) = connect(&manager, "p1:alpha");
        let (mut b, _tb) = connect(&manager, "p2:alpha");
        assert_eq!(a.recv().await["peers"].as_array().unwrap().len(), 0);
        assert_eq!(b.recv().await["peers"].as_array().unwrap().len(), 0);
        assert_eq!(manager.room_count(), 2);

        let close = encode_masked_frame(Opcode::Close, &[], [0, 0, 0, 0]);
        a.input.write_all(&close).await.unwrap();
        ta.await.unwrap();

        for _ in 0..50 {
            if !manager.has_room("p1:alpha") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.has_room("p1:alpha"));
        assert!(manager.has_room("p2:alpha"));
    }

    #[tokio::test]
    async fn test_broadcast_global_reaches_every_room() {
        let manager = Arc::new(RoomManager::new());
        let (mut a, _ta) = connect(&manager, "one");
        let (mut b, _tb) = connect(&manager, "two");
        a.recv().await;
        b.recv().await;

        let sent = manager
            .broadcast_global(&serde_json::json!({"type": "notice", "text": "maintenance"}))
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(a.recv().await["type"], "notice");
        assert_eq!(b.recv().await["type"], "notice");
    }
}
