use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{execution_thread_id, planning_thread_id, Turn};

const THREADS_FILE: &str = "threads.json";

/// Conversation checkpoints keyed by thread id. Each save replaces the whole
/// turn list so a resumed run always sees the last checkpointed state.
pub struct ThreadStore {
    base: PathBuf,
    threads: RwLock<HashMap<String, Vec<Turn>>>,
}

impl ThreadStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let threads = crate::load_map(&base.join(THREADS_FILE)).await?;
        Ok(Self {
            base,
            threads: RwLock::new(threads),
        })
    }

    pub async fn load(&self, thread_id: &str) -> Vec<Turn> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn save(&self, thread_id: &str, turns: Vec<Turn>) -> anyhow::Result<()> {
        self.threads
            .write()
            .await
            .insert(thread_id.to_string(), turns);
        self.flush().await
    }

    pub async fn delete(&self, thread_id: &str) -> anyhow::Result<bool> {
        let removed = self.threads.write().await.remove(thread_id).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    /// Drops the planning thread and every task execution thread that
    /// belongs to the session.
    pub async fn delete_for_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let planning = planning_thread_id(session_id);
        let execution_prefix = execution_thread_id(session_id, "");
        let removed = {
            let mut threads = self.threads.write().await;
            let before = threads.len();
            threads.retain(|id, _| id != &planning && !id.starts_with(&execution_prefix));
            before - threads.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.threads.read().await.clone();
        crate::write_map(&self.base.join(THREADS_FILE), &snapshot).await
    }
}
