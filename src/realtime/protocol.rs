use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::user::Presence;

/// Inbound client message, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    MinerPowerOn { miner_id: String },
    MinerPowerOff { miner_id: String },
    MinerStart { miner_id: String },
    MinerStop { miner_id: String },
    UserSetStatus { status: Presence },
    Ping,
}

impl Command {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Outbound server event: `{ "action": ..., "data": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Pong,
    Session {
        user_id: String,
        guest: bool,
    },
    Error {
        #[serde(rename = "type")]
        kind: String,
        message: String,
    },
    NewBlock {
        height: u64,
        hash: String,
        miner_id: String,
        reward: f64,
        timestamp: i64,
    },
    /// Miner snapshot after a successful transition.
    MinerStateUpdate {
        miner: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A rejected miner command, reported to the connection that sent it.
    MinerStatusUpdate {
        miner: Option<Value>,
        message: String,
    },
    MinerMineSuccess {
        miner: Value,
        height: u64,
        reward: f64,
    },
    MinerMineFail {
        miner_id: String,
        attempts: u64,
        message: String,
    },
    UserConnected {
        user_id: String,
        state: Value,
    },
    UserDisconnected {
        user_id: String,
        state: Value,
    },
    UserStateUpdate {
        user_id: String,
        state: Value,
    },
}

pub const LOGGED_IN_ELSEWHERE: &str = "logged_in_elsewhere";

impl ServerEvent {
    pub fn superseded() -> Self {
        ServerEvent::Error {
            kind: LOGGED_IN_ELSEWHERE.to_string(),
            message: "You have logged in elsewhere".to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_miner_commands() {
        let cmd = Command::parse(r#"{"action":"miner_start","miner_id":"m1"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::MinerStart {
                miner_id: "m1".into()
            }
        );
        let cmd = Command::parse(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(cmd, Command::Ping);
        let cmd = Command::parse(r#"{"action":"user_set_status","status":"away"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::UserSetStatus {
                status: Presence::Away
            }
        );
    }

    #[test]
    fn rejects_unknown_or_malformed() {
        assert!(Command::parse(r#"{"action":"miner_explode","miner_id":"m1"}"#).is_err());
        assert!(Command::parse(r#"{"action":"miner_start"}"#).is_err());
        assert!(Command::parse("not json").is_err());
    }

    #[test]
    fn pong_has_no_data() {
        let v: Value = serde_json::from_str(&ServerEvent::Pong.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"action": "pong"}));
    }

    #[test]
    fn events_are_action_plus_data() {
        let ev = ServerEvent::NewBlock {
            height: 3,
            hash: "h".into(),
            miner_id: "m".into(),
            reward: 1.5,
            timestamp: 7,
        };
        let v: Value = serde_json::from_str(&ev.encode().unwrap()).unwrap();
        assert_eq!(v["action"], "new_block");
        assert_eq!(v["data"]["height"], 3);
        assert_eq!(v["data"]["miner_id"], "m");

        let v: Value = serde_json::from_str(&ServerEvent::superseded().encode().unwrap()).unwrap();
        assert_eq!(v["action"], "error");
        assert_eq!(v["data"]["type"], LOGGED_IN_ELSEWHERE);
    }
}
