use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use cadence_types::ExecutionEvent;

const EXECUTION_LOG_FILE: &str = "execution_log.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub event: ExecutionEvent,
    pub created_at: DateTime<Utc>,
}

/// Append-only event history per session, used to replay past execution
/// activity to reconnecting clients.
pub struct ExecutionLogStore {
    base: PathBuf,
    entries: RwLock<HashMap<String, Vec<ExecutionLogEntry>>>,
}

impl ExecutionLogStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let entries = crate::load_map(&base.join(EXECUTION_LOG_FILE)).await?;
        Ok(Self {
            base,
            entries: RwLock::new(entries),
        })
    }

    /// Appends an event. Events that declare themselves non-persistent
    /// (content deltas, the connection handshake) are dropped here so no
    /// caller can leak them into the log.
    pub async fn append(&self, session_id: &str, event: ExecutionEvent) -> anyhow::Result<()> {
        if !event.should_persist() {
            return Ok(());
        }
        let entry = ExecutionLogEntry {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            event,
            created_at: Utc::now(),
        };
        self.entries
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
        self.flush().await
    }

    /// Chronological slice of the session's log.
    pub async fn list(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<ExecutionLogEntry> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|entries| {
                entries
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, session_id: &str) -> usize {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn delete_for_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let removed = self
            .entries
            .write()
            .await
            .remove(session_id)
            .map(|entries| entries.len())
            .unwrap_or(0);
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.read().await.clone();
        crate::write_map(&self.base.join(EXECUTION_LOG_FILE), &snapshot).await
    }
}
