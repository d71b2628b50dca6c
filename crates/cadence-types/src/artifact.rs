use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Document,
    Note,
    Summary,
    Plan,
    Other,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Document => "document",
            ArtifactType::Note => "note",
            ArtifactType::Summary => "summary",
            ArtifactType::Plan => "plan",
            ArtifactType::Other => "other",
        }
    }

    /// Lenient parse for model-produced type strings; anything unrecognized
    /// lands in `Other`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "document" | "doc" => ArtifactType::Document,
            "note" => ArtifactType::Note,
            "summary" => ArtifactType::Summary,
            "plan" => ArtifactType::Plan,
            _ => ArtifactType::Other,
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, user-visible document produced as a side effect of completing
/// a task. At most one artifact is created per task by the workflow itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "taskID", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        session_id: &str,
        task_id: Option<&str>,
        name: &str,
        artifact_type: ArtifactType,
        content: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            task_id: task_id.map(ToString::to_string),
            name: name.to_string(),
            artifact_type,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            artifact_type: self.artifact_type,
            created_at: self.created_at,
        }
    }
}

/// Artifact metadata without the content body, for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "taskID", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub created_at: DateTime<Utc>,
}
