use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
    Away,
}

/// A registered player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub status: Presence,
    /// Unix millis of the last transition into or out of `Online`.
    pub last_seen: Option<i64>,
    pub avatar_url: Option<String>,
    pub created_at: i64,
}

impl UserRecord {
    pub fn new(user_id: String, username: String, created_at: i64) -> Self {
        Self {
            user_id,
            username,
            status: Presence::Offline,
            last_seen: None,
            avatar_url: None,
            created_at,
        }
    }
}

/// Partial update applied by the store in one write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Presence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserPatch {
    /// Presence change from `previous` to `next` at `now`. `last_seen` is
    /// stamped when entering `Online` and when leaving it for away/offline.
    pub fn presence(previous: Presence, next: Presence, now: i64) -> Self {
        let stamp = match next {
            Presence::Online => true,
            Presence::Offline | Presence::Away => previous == Presence::Online,
        };
        Self {
            status: Some(next),
            last_seen: stamp.then_some(now),
            avatar_url: None,
        }
    }

    pub fn apply(&self, user: &mut UserRecord) {
        if let Some(status) = self.status {
            user.status = status;
        }
        if let Some(ts) = self.last_seen {
            user.last_seen = Some(ts);
        }
        if let Some(url) = &self.avatar_url {
            user.avatar_url = Some(url.clone());
        }
    }
}
