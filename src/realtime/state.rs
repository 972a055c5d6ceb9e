use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;

use super::protocol::ServerEvent;
use super::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    User,
    Miner,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::User => f.write_str("user"),
            StateKind::Miner => f.write_str("miner"),
        }
    }
}

impl FromStr for StateKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(StateKind::User),
            "miner" => Ok(StateKind::Miner),
            other => Err(StateError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("unknown state kind {0:?}")]
    UnknownKind(String),
    #[error("partial state must be a JSON object")]
    NotAnObject,
}

pub type StateRecord = Map<String, Value>;

/// Field stamped on every record by `set`.
pub const UPDATED_AT: &str = "updated_at";

/// In-memory mirror of user and miner state, pushed to the connections that
/// care about it.
///
/// User records go to every *other* connection (presence), miner records go
/// only to the owning user's connection.
pub struct StateBroadcaster {
    registry: Arc<ConnectionRegistry>,
    records: DashMap<(StateKind, String), StateRecord>,
}

impl StateBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            records: DashMap::new(),
        }
    }

    /// Shallow-merge `partial` into the record for `(kind, id)` and stamp it.
    pub fn set(&self, kind: StateKind, id: &str, partial: Value) -> Result<StateRecord, StateError> {
        let Value::Object(fields) = partial else {
            return Err(StateError::NotAnObject);
        };
        let mut entry = self.records.entry((kind, id.to_string())).or_default();
        let record = entry.value_mut();
        for (key, value) in fields {
            record.insert(key, value);
        }
        record.insert(UPDATED_AT.to_string(), Value::from(Utc::now().timestamp_millis()));
        Ok(record.clone())
    }

    /// `set` keyed by a kind name, as read off the wire or a config file.
    pub fn set_named(&self, kind: &str, id: &str, partial: Value) -> Result<StateRecord, StateError> {
        self.set(kind.parse()?, id, partial)
    }

    pub fn get(&self, kind: StateKind, id: &str) -> Option<StateRecord> {
        self.records
            .get(&(kind, id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn all(&self, kind: StateKind) -> Vec<(String, StateRecord)> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    pub fn remove(&self, kind: StateKind, id: &str) -> Option<StateRecord> {
        self.records
            .remove(&(kind, id.to_string()))
            .map(|(_, record)| record)
    }

    pub fn broadcast(&self, kind: StateKind, id: &str) -> usize {
        self.announce(kind, id, None)
    }

    /// Send the full record for `(kind, id)`, optionally with a message.
    /// Returns the number of connections reached.
    pub fn announce(&self, kind: StateKind, id: &str, message: Option<String>) -> usize {
        let Some(record) = self.get(kind, id) else {
            debug!("no {kind} state for {id}; nothing to broadcast");
            return 0;
        };
        match kind {
            StateKind::User => {
                let event = ServerEvent::UserStateUpdate {
                    user_id: id.to_string(),
                    state: Value::Object(record),
                };
                self.registry.send_all(&event, Some(id))
            }
            StateKind::Miner => {
                let Some(owner) = record.get("user_id").and_then(Value::as_str).map(str::to_owned)
                else {
                    debug!("miner {id} has no owner in its state; not broadcasting");
                    return 0;
                };
                let event = ServerEvent::MinerStateUpdate {
                    miner: Value::Object(record),
                    message,
                };
                usize::from(self.registry.send_to(&owner, &event))
            }
        }
    }
}
