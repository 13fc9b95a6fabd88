use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ChatError;

pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Opaque handle for one live realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Trims a client-supplied name, falling back to `Anonymous` when nothing is left.
pub fn display_name_or_default(name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_DISPLAY_NAME.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "connectionId")]
    pub connection_id: ConnectionId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "joinedAt")]
    pub joined_at: DateTime<Utc>,
}

/// The set of joined participants, keyed by connection.
#[derive(Default)]
pub struct PresenceRegistry {
    participants: RwLock<HashMap<ConnectionId, Participant>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        connection_id: ConnectionId,
        display_name: Option<&str>,
    ) -> Result<Participant, ChatError> {
        let mut participants = self.participants.write().await;
        match participants.entry(connection_id) {
            Entry::Occupied(_) => Err(ChatError::DuplicateConnection(connection_id)),
            Entry::Vacant(slot) => {
                let participant = Participant {
                    connection_id,
                    display_name: display_name_or_default(display_name),
                    joined_at: Utc::now(),
                };
                slot.insert(participant.clone());
                Ok(participant)
            }
        }
    }

    /// Removes the participant if present. Calling it again is a no-op.
    pub async fn unregister(&self, connection_id: &ConnectionId) -> Option<Participant> {
        let mut participants = self.participants.write().await;
        participants.remove(connection_id)
    }

    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Participant> {
        let participants = self.participants.read().await;
        participants.get(connection_id).cloned()
    }

    /// Snapshot of everyone currently joined, oldest first.
    pub async fn list_active(&self) -> Vec<Participant> {
        let participants = self.participants.read().await;
        let mut active: Vec<Participant> = participants.values().cloned().collect();
        active.sort_by_key(|p| p.joined_at);
        active
    }

    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_become_anonymous() {
        assert_eq!(display_name_or_default(None), "Anonymous");
        assert_eq!(display_name_or_default(Some("")), "Anonymous");
        assert_eq!(display_name_or_default(Some("   ")), "Anonymous");
        assert_eq!(display_name_or_default(Some(" Alice ")), "Alice");
    }

    #[tokio::test]
    async fn register_rejects_duplicate_connection() {
        let registry = PresenceRegistry::new();
        let id = ConnectionId::new();

        let alice = registry.register(id, Some("Alice")).await.unwrap();
        assert_eq!(alice.display_name, "Alice");

        let err = registry.register(id, Some("Mallory")).await.unwrap_err();
        assert!(matches!(err, ChatError::DuplicateConnection(dup) if dup == id));
        assert_eq!(registry.get(&id).await.unwrap().display_name, "Alice");
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = PresenceRegistry::new();
        let id = ConnectionId::new();
        let other = ConnectionId::new();
        registry.register(id, Some("Alice")).await.unwrap();
        registry.register(other, None).await.unwrap();

        assert!(registry.unregister(&id).await.is_some());
        assert!(registry.unregister(&id).await.is_none());

        let active = registry.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].connection_id, other);
        assert_eq!(active[0].display_name, "Anonymous");
    }

    #[tokio::test]
    async fn list_active_is_ordered_by_join_time() {
        let registry = PresenceRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(ConnectionId::new(), Some(name)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let names: Vec<String> = registry
            .list_active()
            .await
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
