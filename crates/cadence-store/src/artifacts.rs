use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{Artifact, ArtifactSummary, ArtifactType};

const ARTIFACTS_FILE: &str = "artifacts.json";

pub const MAX_ARTIFACT_CONTENT_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone)]
pub enum ArtifactValidationError {
    EmptyName,
    EmptyContent,
    ContentTooLarge { bytes: usize },
}

impl std::fmt::Display for ArtifactValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactValidationError::EmptyName => write!(f, "artifact name must not be empty"),
            ArtifactValidationError::EmptyContent => {
                write!(f, "artifact content must not be empty")
            }
            ArtifactValidationError::ContentTooLarge { bytes } => write!(
                f,
                "artifact content is {bytes} bytes, limit is {MAX_ARTIFACT_CONTENT_BYTES}"
            ),
        }
    }
}

impl std::error::Error for ArtifactValidationError {}

pub fn validate_artifact(name: &str, content: &str) -> Result<(), ArtifactValidationError> {
    if name.trim().is_empty() {
        return Err(ArtifactValidationError::EmptyName);
    }
    if content.trim().is_empty() {
        return Err(ArtifactValidationError::EmptyContent);
    }
    if content.len() > MAX_ARTIFACT_CONTENT_BYTES {
        return Err(ArtifactValidationError::ContentTooLarge {
            bytes: content.len(),
        });
    }
    Ok(())
}

pub struct ArtifactStore {
    base: PathBuf,
    artifacts: RwLock<HashMap<String, Artifact>>,
}

impl ArtifactStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let artifacts = crate::load_map(&base.join(ARTIFACTS_FILE)).await?;
        Ok(Self {
            base,
            artifacts: RwLock::new(artifacts),
        })
    }

    pub async fn create(
        &self,
        session_id: &str,
        task_id: Option<&str>,
        name: &str,
        artifact_type: ArtifactType,
        content: String,
    ) -> anyhow::Result<Artifact> {
        validate_artifact(name, &content)?;
        let artifact = Artifact::new(session_id, task_id, name.trim(), artifact_type, content);
        self.artifacts
            .write()
            .await
            .insert(artifact.id.clone(), artifact.clone());
        self.flush().await?;
        Ok(artifact)
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    /// Metadata only, oldest first.
    pub async fn list_for_session(&self, session_id: &str) -> Vec<ArtifactSummary> {
        let mut out = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| a.session_id == session_id)
            .map(Artifact::summary)
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn find_for_task(&self, session_id: &str, task_id: &str) -> Option<Artifact> {
        self.artifacts
            .read()
            .await
            .values()
            .find(|a| a.session_id == session_id && a.task_id.as_deref() == Some(task_id))
            .cloned()
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.artifacts.write().await.remove(id).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn delete_for_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let removed = {
            let mut artifacts = self.artifacts.write().await;
            let before = artifacts.len();
            artifacts.retain(|_, a| a.session_id != session_id);
            before - artifacts.len()
        };
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.artifacts.read().await.clone();
        crate::write_map(&self.base.join(ARTIFACTS_FILE), &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_base(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cadence-store-{tag}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let store = ArtifactStore::new(temp_base("artifacts-size"))
            .await
            .expect("store");
        let content = "x".repeat(MAX_ARTIFACT_CONTENT_BYTES + 1);
        let err = store
            .create("s1", None, "big", ArtifactType::Document, content)
            .await
            .expect_err("oversized");
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let store = ArtifactStore::new(temp_base("artifacts-name"))
            .await
            .expect("store");
        let err = store
            .create("s1", None, "   ", ArtifactType::Note, "body".to_string())
            .await
            .expect_err("blank name");
        assert!(err.to_string().contains("name"));
    }

    #[tokio::test]
    async fn find_for_task_matches_session_and_task() {
        let store = ArtifactStore::new(temp_base("artifacts-find"))
            .await
            .expect("store");
        store
            .create("s1", Some("t1"), "notes", ArtifactType::Note, "a".to_string())
            .await
            .expect("create");
        store
            .create("s2", Some("t1"), "other", ArtifactType::Note, "b".to_string())
            .await
            .expect("create");

        let found = store.find_for_task("s1", "t1").await.expect("artifact");
        assert_eq!(found.name, "notes");
        assert!(store.find_for_task("s1", "t2").await.is_none());
    }

    #[tokio::test]
    async fn list_returns_summaries_without_content() {
        let store = ArtifactStore::new(temp_base("artifacts-list"))
            .await
            .expect("store");
        store
            .create("s1", None, "doc", ArtifactType::Document, "body".to_string())
            .await
            .expect("create");

        let listed = store.list_for_session("s1").await;
        assert_eq!(listed.len(), 1);
        let encoded = serde_json::to_value(&listed[0]).expect("encode");
        assert!(encoded.get("content").is_none());
        assert_eq!(encoded["type"], "document");
    }
}
