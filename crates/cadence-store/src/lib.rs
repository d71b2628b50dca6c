//! JSON-file persistence for sessions, tasks, connections, artifacts,
//! execution logs, and conversation threads. Each store keeps an in-memory
//! map guarded by an `RwLock` and flushes the whole map to its own file
//! under the base directory after every mutation.

use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

pub mod artifacts;
pub mod connections;
pub mod execution_log;
pub mod sessions;
pub mod tasks;
pub mod threads;

pub use artifacts::{ArtifactStore, ArtifactValidationError, MAX_ARTIFACT_CONTENT_BYTES};
pub use connections::{ConnectionStatus, ConnectionStore};
pub use execution_log::{ExecutionLogEntry, ExecutionLogStore};
pub use sessions::SessionStore;
pub use tasks::{TaskStore, TaskTransitionError};
pub use threads::ThreadStore;

async fn load_map<V: DeserializeOwned>(path: &Path) -> anyhow::Result<HashMap<String, V>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<HashMap<String, V>>(&raw).unwrap_or_default())
}

async fn write_map<V: Serialize>(path: &Path, map: &HashMap<String, V>) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(map)?;
    fs::write(path, payload).await?;
    Ok(())
}
