use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::protocol::ServerEvent;
use super::registry::ConnectionRegistry;
use super::state::{StateBroadcaster, StateError, StateKind, StateRecord};
use crate::store::{Store, StoreError};
use crate::user::{Presence, UserPatch, UserRecord};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to encode user state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    /// Guests have no stored record; they live only in memory.
    pub guest: bool,
}

impl Identity {
    pub fn guest() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(1000..10000);
        Self {
            user_id: format!("guest-{}", Uuid::new_v4().simple()),
            username: format!("Guest{suffix}"),
            guest: true,
        }
    }

    pub fn user(record: &UserRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            username: record.username.clone(),
            guest: false,
        }
    }
}

/// Online/away/offline bookkeeping for connected users.
pub struct PresenceService {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    states: Arc<StateBroadcaster>,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        states: Arc<StateBroadcaster>,
    ) -> Self {
        Self {
            store,
            registry,
            states,
        }
    }

    /// Mark `identity` online and tell every other connection.
    pub async fn connect(&self, identity: &Identity) -> Result<StateRecord, PresenceError> {
        let state = self.transition(identity, Presence::Online).await?;
        info!("User {} ({}) connected", identity.user_id, identity.username);
        self.registry.send_all(
            &ServerEvent::UserConnected {
                user_id: identity.user_id.clone(),
                state: Value::Object(state.clone()),
            },
            Some(&identity.user_id),
        );
        Ok(state)
    }

    /// Explicit presence change requested by the user (e.g. away).
    pub async fn set_status(
        &self,
        identity: &Identity,
        status: Presence,
    ) -> Result<StateRecord, PresenceError> {
        let state = self.transition(identity, status).await?;
        self.states.broadcast(StateKind::User, &identity.user_id);
        Ok(state)
    }

    /// Mark `identity` offline. Guests are forgotten; stored users stay in
    /// the mirror as offline.
    pub async fn disconnect(&self, identity: &Identity) -> Result<StateRecord, PresenceError> {
        let mut state = self.transition(identity, Presence::Offline).await?;
        if identity.guest {
            state = self
                .states
                .remove(StateKind::User, &identity.user_id)
                .unwrap_or(state);
        }
        info!("User {} disconnected", identity.user_id);
        self.registry.send_all(
            &ServerEvent::UserDisconnected {
                user_id: identity.user_id.clone(),
                state: Value::Object(state.clone()),
            },
            Some(&identity.user_id),
        );
        Ok(state)
    }

    fn current(&self, identity: &Identity) -> Presence {
        self.states
            .get(StateKind::User, &identity.user_id)
            .and_then(|r| r.get("status").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(Presence::Offline)
    }

    /// Persist (stored users only) and mirror a presence change.
    async fn transition(
        &self,
        identity: &Identity,
        next: Presence,
    ) -> Result<StateRecord, PresenceError> {
        let now = Utc::now().timestamp_millis();
        let patch = UserPatch::presence(self.current(identity), next, now);

        let partial = if identity.guest {
            let mut view = serde_json::json!({
                "user_id": identity.user_id,
                "username": identity.username,
                "status": next,
                "guest": true,
            });
            if let Some(ts) = patch.last_seen {
                view["last_seen"] = Value::from(ts);
            }
            view
        } else {
            let record = self
                .store
                .update_user(&identity.user_id, &patch)
                .await
                .inspect_err(|e| {
                    error!("Failed to update user status for {}: {e}", identity.user_id)
                })?;
            let mut view = serde_json::to_value(&record)?;
            view["guest"] = Value::Bool(false);
            view
        };

        Ok(self.states.set(StateKind::User, &identity.user_id, partial)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::tests::{connection, events};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        states: Arc<StateBroadcaster>,
        presence: PresenceService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let states = Arc::new(StateBroadcaster::new(registry.clone()));
        let presence = PresenceService::new(store.clone(), registry.clone(), states.clone());
        Fixture {
            store,
            registry,
            states,
            presence,
        }
    }

    #[tokio::test]
    async fn stored_user_round_trip() {
        let f = fixture();
        let record = UserRecord::new("u1".into(), "alice".into(), 0);
        f.store.insert_user(&record).await.unwrap();
        let alice = Identity::user(&record);

        let (watcher, mut rx) = connection();
        f.registry.add("bob", watcher);
        let (own, mut own_rx) = connection();
        f.registry.add("u1", own);

        let state = f.presence.connect(&alice).await.unwrap();
        assert_eq!(state["status"], "online");
        let got = events(&mut rx);
        assert_eq!(got[0]["action"], "user_connected");
        assert_eq!(got[0]["data"]["user_id"], "u1");
        assert!(events(&mut own_rx).is_empty());

        let away = f.presence.set_status(&alice, Presence::Away).await.unwrap();
        let stored = f.store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.status, Presence::Away);
        assert_eq!(Some(away["last_seen"].as_i64().unwrap()), stored.last_seen);
        assert_eq!(events(&mut rx)[0]["action"], "user_state_update");

        f.registry.remove("u1");
        f.presence.disconnect(&alice).await.unwrap();
        let stored = f.store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.status, Presence::Offline);
        // away -> offline keeps the last-seen of leaving online
        assert_eq!(Some(away["last_seen"].as_i64().unwrap()), stored.last_seen);
        assert_eq!(
            f.states.get(StateKind::User, "u1").unwrap()["status"],
            "offline"
        );
        assert_eq!(events(&mut rx)[0]["action"], "user_disconnected");
    }

    #[tokio::test]
    async fn guests_are_forgotten_on_disconnect() {
        let f = fixture();
        let guest = Identity::guest();
        assert!(guest.user_id.starts_with("guest-"));

        f.presence.connect(&guest).await.unwrap();
        assert!(f.states.get(StateKind::User, &guest.user_id).is_some());
        assert!(f.store.get_user(&guest.user_id).await.unwrap().is_none());

        let last = f.presence.disconnect(&guest).await.unwrap();
        assert_eq!(last["status"], "offline");
        assert!(f.states.get(StateKind::User, &guest.user_id).is_none());
    }

    #[tokio::test]
    async fn storage_failure_surfaces() {
        let f = fixture();
        let record = UserRecord::new("u1".into(), "alice".into(), 0);
        f.store.insert_user(&record).await.unwrap();
        f.store.fail_writes(true);
        assert!(f.presence.connect(&Identity::user(&record)).await.is_err());
        assert!(f.states.get(StateKind::User, "u1").is_none());
    }
}
