//! Per-room collaboration state machine.
//!
//! A [`Room`] owns the shared document, its revision counter, the lock table
//! and the member list. Every operation is synchronous and returns an
//! [`Outbox`] describing who receives what; the caller (the room task in
//! [`crate::collab`]) performs the actual sends. Keeping I/O out of this
//! module makes every protocol rule testable without sockets.
//!
//! ```text
//! join ──► welcome (joiner) + peer-joined (others)
//! state ─► baseRevision == revision ? state-ack + state : state-rejected
//! lock ──► free or owned ? lock-granted + lock-updated : lock-denied
//! leave ─► lock-updated(released) × k + peer-left
//! ```

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::connection::ConnectionId;
use crate::protocol::{
    now_millis, sanitize_presence, ClientMessage, CursorPosition, EntityType, LockAction,
    LockInfo, PeerInfo, ServerMessage, LOCK_DENIED_ALREADY_LOCKED,
};

/// Colors handed out round-robin to joining members.
pub const PALETTE: [&str; 8] = [
    "#ff4d4f", "#40a9ff", "#73d13d", "#9254de", "#fa8c16", "#13c2c2", "#eb2f96", "#fadb14",
];

// ───────────────────────────────────────────────────────────────────
// Deliveries
// ───────────────────────────────────────────────────────────────────

/// Target of a delivery, resolved against the room's member list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    One(ConnectionId),
    AllExcept(ConnectionId),
    All,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub to: Recipient,
    pub message: ServerMessage,
}

impl Delivery {
    fn one(id: ConnectionId, message: ServerMessage) -> Self {
        Self { to: Recipient::One(id), message }
    }

    fn others(id: ConnectionId, message: ServerMessage) -> Self {
        Self { to: Recipient::AllExcept(id), message }
    }

    fn all(message: ServerMessage) -> Self {
        Self { to: Recipient::All, message }
    }
}

/// Messages produced by one room operation, in send order.
pub type Outbox = Vec<Delivery>;

// ───────────────────────────────────────────────────────────────────
// Room
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnectionId,
    pub color: String,
    pub crew_member_id: Option<String>,
}

impl Member {
    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            client_id: self.id,
            color: self.color.clone(),
            crew_member_id: self.crew_member_id.clone(),
        }
    }
}

type LockKey = (EntityType, String);

/// Shared state of one collaboration room.
#[derive(Debug)]
pub struct Room {
    key: String,
    latest_state: Value,
    revision: u64,
    locks: BTreeMap<LockKey, LockInfo>,
    /// Join order
    members: Vec<Member>,
    next_color: usize,
}

impl Room {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            latest_state: Value::Null,
            revision: 0,
            locks: BTreeMap::new(),
            members: Vec::new(),
            next_color: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn latest_state(&self) -> &Value {
        &self.latest_state
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: &ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == *id)
    }

    /// Active locks ordered by `(entityType, entityId)`.
    pub fn locks(&self) -> Vec<LockInfo> {
        self.locks.values().cloned().collect()
    }

    pub fn lock_owner(&self, entity_type: EntityType, entity_id: &str) -> Option<ConnectionId> {
        self.locks
            .get(&(entity_type, entity_id.to_string()))
            .map(|lock| lock.owner_id)
    }

    fn next_color(&mut self) -> String {
        let color = PALETTE[self.next_color % PALETTE.len()];
        self.next_color = self.next_color.wrapping_add(1);
        color.to_string()
    }

    /// Add a member. The welcome is always the first delivery.
    pub fn join(&mut self, id: ConnectionId, crew_member_id: Option<String>) -> Outbox {
        if self.member(&id).is_some() {
            log::warn!("Connection {id} joined room {} twice", self.key);
            return Vec::new();
        }

        let color = self.next_color();
        let peers = self.members.iter().map(Member::peer_info).collect();
        let member = Member {
            id,
            color: color.clone(),
            crew_member_id: crew_member_id.clone(),
        };
        self.members.push(member);

        vec![
            Delivery::one(
                id,
                ServerMessage::Welcome {
                    client_id: id,
                    color: color.clone(),
                    crew_member_id: crew_member_id.clone(),
                    peers,
                    state: self.latest_state.clone(),
                    revision: self.revision,
                    locks: self.locks(),
                },
            ),
            Delivery::others(
                id,
                ServerMessage::PeerJoined {
                    client_id: id,
                    color,
                    crew_member_id,
                },
            ),
        ]
    }

    /// Remove a member, releasing its locks before announcing the departure.
    pub fn leave(&mut self, id: &ConnectionId) -> Outbox {
        let Some(pos) = self.members.iter().position(|m| m.id == *id) else {
            return Vec::new();
        };
        self.members.remove(pos);

        let owned: Vec<LockKey> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.owner_id == *id)
            .map(|(key, _)| key.clone())
            .collect();

        let mut outbox = Vec::with_capacity(owned.len() + 1);
        for key in owned {
            if let Some(lock) = self.locks.remove(&key) {
                outbox.push(Delivery::all(ServerMessage::LockUpdated {
                    action: LockAction::Released,
                    lock,
                }));
            }
        }
        outbox.push(Delivery::all(ServerMessage::PeerLeft { client_id: *id }));
        outbox
    }

    /// Dispatch a parsed client message from a member.
    pub fn handle(&mut self, from: ConnectionId, msg: ClientMessage) -> Outbox {
        if self.member(&from).is_none() {
            log::debug!("Ignoring message from non-member {from} in room {}", self.key);
            return Vec::new();
        }
        match msg {
            ClientMessage::Cursor { cursor } => self.cursor(from, &cursor),
            ClientMessage::State {
                request_id,
                base_revision,
                state,
            } => self.apply_state(from, request_id, base_revision, state),
            ClientMessage::LockRequest {
                request_id,
                entity_type,
                entity_id,
            } => self.request_lock(from, request_id, entity_type, entity_id),
            ClientMessage::LockRelease {
                entity_type,
                entity_id,
            } => self.release_lock(from, entity_type, &entity_id),
            ClientMessage::ArPresence { presence } => self.presence(from, &presence),
        }
    }

    fn color_of(&self, id: &ConnectionId) -> String {
        self.member(id).map(|m| m.color.clone()).unwrap_or_default()
    }

    pub fn cursor(&mut self, from: ConnectionId, cursor: &Value) -> Outbox {
        let message = ServerMessage::Cursor {
            client_id: from,
            color: self.color_of(&from),
            cursor: CursorPosition::from_value(cursor),
            at: now_millis(),
        };
        vec![Delivery::others(from, message)]
    }

    /// Optimistic-concurrency document update.
    pub fn apply_state(
        &mut self,
        from: ConnectionId,
        request_id: Option<Value>,
        base_revision: u64,
        state: Value,
    ) -> Outbox {
        if base_revision != self.revision {
            log::debug!(
                "Rejected state from {from} in room {}: base {base_revision}, current {}",
                self.key,
                self.revision
            );
            return vec![Delivery::one(
                from,
                ServerMessage::StateRejected {
                    request_id,
                    expected_revision: self.revision,
                    state: self.latest_state.clone(),
                },
            )];
        }

        self.latest_state = state;
        self.revision += 1;

        vec![
            Delivery::one(
                from,
                ServerMessage::StateAck {
                    request_id,
                    revision: self.revision,
                },
            ),
            Delivery::others(
                from,
                ServerMessage::State {
                    client_id: from,
                    state: self.latest_state.clone(),
                    revision: self.revision,
                    at: now_millis(),
                },
            ),
        ]
    }

    /// Grant when free or already owned by `from`; otherwise deny.
    pub fn request_lock(
        &mut self,
        from: ConnectionId,
        request_id: Option<Value>,
        entity_type: EntityType,
        entity_id: String,
    ) -> Outbox {
        let key = (entity_type, entity_id);
        if let Some(existing) = self.locks.get(&key) {
            if existing.owner_id != from {
                return vec![Delivery::one(
                    from,
                    ServerMessage::LockDenied {
                        request_id,
                        entity_type,
                        entity_id: key.1,
                        reason: LOCK_DENIED_ALREADY_LOCKED.to_string(),
                        owner_id: existing.owner_id,
                        owner_color: existing.owner_color.clone(),
                    },
                )];
            }
        }

        let owner_color = self.color_of(&from);
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| LockInfo {
                entity_type,
                entity_id: key.1,
                owner_id: from,
                owner_color,
                acquired_at: now_millis(),
            })
            .clone();

        vec![
            Delivery::one(
                from,
                ServerMessage::LockGranted {
                    request_id,
                    lock: lock.clone(),
                },
            ),
            Delivery::others(
                from,
                ServerMessage::LockUpdated {
                    action: LockAction::Locked,
                    lock,
                },
            ),
        ]
    }

    /// Release a lock owned by `from`. Releases by anyone else are ignored.
    pub fn release_lock(
        &mut self,
        from: ConnectionId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Outbox {
        let key = (entity_type, entity_id.to_string());
        match self.locks.get(&key) {
            Some(lock) if lock.owner_id == from => {}
            Some(lock) => {
                log::debug!(
                    "Ignoring release of {entity_id} by {from}; owned by {}",
                    lock.owner_id
                );
                return Vec::new();
            }
            None => return Vec::new(),
        }
        let Some(lock) = self.locks.remove(&key) else {
            return Vec::new();
        };
        vec![Delivery::all(ServerMessage::LockUpdated {
            action: LockAction::Released,
            lock,
        })]
    }

    pub fn presence(&mut self, from: ConnectionId, presence: &Map<String, Value>) -> Outbox {
        let message = ServerMessage::ArPresence {
            client_id: from,
            color: self.color_of(&from),
            presence: sanitize_presence(presence),
            at: now_millis(),
        };
        vec![Delivery::others(from, message)]
    }
}
