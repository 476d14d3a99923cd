//! Crew presence: which external identities are currently online.
//!
//! A reduced variant of the room service. Connections announce an identity
//! with `crew-presence-identify`; whenever the set of identities changes,
//! every connection receives the full sorted online list.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, ConnectionRegistry};
use crate::connection::{ConnectionError, ConnectionId, WsConnection};
use crate::protocol::{parse_envelope, ProtocolError};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PresenceClientMessage {
    CrewPresenceIdentify {
        #[serde(default)]
        crew_member_id: Option<String>,
    },
}

impl PresenceClientMessage {
    pub const TYPES: &'static [&'static str] = &["crew-presence-identify"];

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        parse_envelope(text, Self::TYPES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PresenceServerMessage {
    CrewPresenceWelcome { client_id: Uuid, online: Vec<String> },
    CrewPresenceUpdate { online: Vec<String> },
}

/// Online identity tracker for the presence endpoint.
#[derive(Default)]
pub struct PresenceHub {
    registry: ConnectionRegistry,
    identities: Mutex<HashMap<ConnectionId, Option<String>>>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct identified members, sorted.
    pub fn online(&self) -> Vec<String> {
        online_of(&self.identities.lock())
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.registry.stats()
    }

    fn connect(&self, conn: &WsConnection) {
        let id = conn.id();
        let mut identities = self.identities.lock();
        identities.insert(id, None);
        self.registry.register(conn.handle().clone());
        let welcome = PresenceServerMessage::CrewPresenceWelcome {
            client_id: id,
            online: online_of(&identities),
        };
        if let Err(e) = conn.handle().send_json(&welcome) {
            log::debug!("Presence welcome to {id} not queued: {e}");
        }
    }

    /// Set or clear a connection's identity. Returns whether it changed.
    pub fn identify(&self, id: ConnectionId, crew_member_id: Option<String>) -> bool {
        let crew_member_id = crew_member_id.filter(|c| !c.is_empty());
        let mut identities = self.identities.lock();
        let Some(slot) = identities.get_mut(&id) else {
            return false;
        };
        if *slot == crew_member_id {
            return false;
        }
        *slot = crew_member_id;
        self.broadcast_online(&identities);
        true
    }

    fn disconnect(&self, id: &ConnectionId) {
        let mut identities = self.identities.lock();
        self.registry.unregister(id);
        if let Some(Some(_)) = identities.remove(id) {
            self.broadcast_online(&identities);
        }
    }

    fn broadcast_online(&self, identities: &HashMap<ConnectionId, Option<String>>) {
        let update = PresenceServerMessage::CrewPresenceUpdate {
            online: online_of(identities),
        };
        if let Err(e) = self.registry.broadcast_json(&update, None) {
            log::error!("Failed to encode presence update: {e}");
        }
    }

    /// Run one presence connection until it closes.
    pub async fn serve(&self, conn: &mut WsConnection) -> Result<(), ConnectionError> {
        let id = conn.id();
        self.connect(conn);
        log::info!("Presence connection {id} opened");

        let result = loop {
            match conn.next_message().await {
                Ok(Some(text)) => match PresenceClientMessage::parse(&text) {
                    Ok(PresenceClientMessage::CrewPresenceIdentify { crew_member_id }) => {
                        if self.identify(id, crew_member_id) {
                            log::debug!("Presence connection {id} identity changed");
                        }
                    }
                    Err(e) => log::debug!("{id}: dropping presence message: {e}"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.disconnect(&id);
        conn.handle().close();
        log::info!("Presence connection {id} closed");
        result
    }
}

fn online_of(identities: &HashMap<ConnectionId, Option<String>>) -> Vec<String> {
    identities
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
