use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Planning => "planning",
            SessionStatus::Executing => "executing",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
        }
    }

    /// Tasks may only be (re)executed from these states.
    pub fn can_execute(self) -> bool {
        matches!(self, SessionStatus::Planning | SessionStatus::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.unwrap_or_else(|| "New Session".to_string()),
            status: SessionStatus::Planning,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One connection record per session, upsert-replace semantics. Registering a
/// new connection supersedes the previous identifier and clears any stale
/// pause request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub pause_requested: bool,
    pub created_at: DateTime<Utc>,
}
