use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{Session, SessionStatus};

const SESSIONS_FILE: &str = "sessions.json";

pub struct SessionStore {
    base: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let sessions = crate::load_map(&base.join(SESSIONS_FILE)).await?;
        Ok(Self {
            base,
            sessions: RwLock::new(sessions),
        })
    }

    pub async fn create(&self, title: Option<String>) -> anyhow::Result<Session> {
        let session = Session::new(title);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush().await?;
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<Session> {
        let mut all = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(session) => {
                    session.status = status;
                    session.updated_at = Utc::now();
                    Some(session.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    pub async fn set_title(&self, id: &str, title: String) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(session) => {
                    session.title = title;
                    session.updated_at = Utc::now();
                    Some(session.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.sessions.read().await.clone();
        crate::write_map(&self.base.join(SESSIONS_FILE), &snapshot).await
    }
}
