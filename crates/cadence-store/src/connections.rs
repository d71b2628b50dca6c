use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{ConnectionRecord, PauseReason};

const CONNECTIONS_FILE: &str = "connections.json";

/// Liveness verdict for a specific connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Inactive(PauseReason),
}

/// Connection liveness registry, one record per session. The executing
/// stream registers its connection id, the client heartbeats it, and the
/// orchestrator consults `check_status` at safe checkpoints.
pub struct ConnectionStore {
    base: PathBuf,
    connections: RwLock<HashMap<String, ConnectionRecord>>,
}

impl ConnectionStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let connections = crate::load_map(&base.join(CONNECTIONS_FILE)).await?;
        Ok(Self {
            base,
            connections: RwLock::new(connections),
        })
    }

    /// Upsert-replace: a new registration supersedes whatever connection was
    /// recorded before and clears any stale pause request.
    pub async fn register(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> anyhow::Result<ConnectionRecord> {
        let now = Utc::now();
        let record = ConnectionRecord {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
            last_heartbeat: now,
            pause_requested: false,
            created_at: now,
        };
        self.connections
            .write()
            .await
            .insert(session_id.to_string(), record.clone());
        self.flush().await?;
        Ok(record)
    }

    /// Touches the heartbeat timestamp, but only while `connection_id` is
    /// still the registered connection. Returns whether the touch landed.
    pub async fn heartbeat(&self, session_id: &str, connection_id: &str) -> anyhow::Result<bool> {
        let touched = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(session_id) {
                Some(record) if record.connection_id == connection_id => {
                    record.last_heartbeat = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if touched {
            self.flush().await?;
        }
        Ok(touched)
    }

    pub async fn request_pause(&self, session_id: &str) -> anyhow::Result<bool> {
        let requested = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(session_id) {
                Some(record) => {
                    record.pause_requested = true;
                    true
                }
                None => false,
            }
        };
        if requested {
            self.flush().await?;
        }
        Ok(requested)
    }

    /// Liveness check from the point of view of connection `connection_id`.
    /// An explicit pause request wins over every disconnect signal; after
    /// that, a missing record, a superseding registration, or a heartbeat
    /// older than `timeout` all read as a client disconnect.
    pub async fn check_status(
        &self,
        session_id: &str,
        connection_id: &str,
        timeout: Duration,
    ) -> ConnectionStatus {
        let connections = self.connections.read().await;
        let Some(record) = connections.get(session_id) else {
            return ConnectionStatus::Inactive(PauseReason::ClientDisconnected);
        };
        if record.pause_requested {
            return ConnectionStatus::Inactive(PauseReason::UserRequested);
        }
        if record.connection_id != connection_id {
            return ConnectionStatus::Inactive(PauseReason::ClientDisconnected);
        }
        let age = Utc::now().signed_duration_since(record.last_heartbeat);
        if age.num_milliseconds() > timeout.as_millis() as i64 {
            return ConnectionStatus::Inactive(PauseReason::ClientDisconnected);
        }
        ConnectionStatus::Active
    }

    pub async fn get(&self, session_id: &str) -> Option<ConnectionRecord> {
        self.connections.read().await.get(session_id).cloned()
    }

    /// Removes the record, but only if `connection_id` still owns it. A run
    /// that was superseded must not clear its successor's registration.
    pub async fn clear(&self, session_id: &str, connection_id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(session_id) {
                Some(record) if record.connection_id == connection_id => {
                    connections.remove(session_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn delete_for_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let removed = self.connections.write().await.remove(session_id).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.connections.read().await.clone();
        crate::write_map(&self.base.join(CONNECTIONS_FILE), &snapshot).await
    }
}
