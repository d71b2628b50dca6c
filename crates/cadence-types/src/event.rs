use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ArtifactType, TaskStatus};

/// Why an execution stream stopped before completing the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UserRequested,
    ClientDisconnected,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::UserRequested => "user_requested",
            PauseReason::ClientDisconnected => "client_disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Every event the execution pipeline can emit, as a closed union so each
/// consumer (log sink, SSE encoder, orchestrator bookkeeping) handles the
/// full set exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Incremental generated text. High volume; never persisted to the log.
    Content {
        #[serde(rename = "taskId")]
        task_id: String,
        content: String,
    },
    ToolCall {
        #[serde(rename = "taskId")]
        task_id: String,
        tool: String,
        input: Value,
    },
    ToolResult {
        #[serde(rename = "taskId")]
        task_id: String,
        tool: String,
        output: String,
    },
    ArtifactAnalysisStart {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ArtifactCreated {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "artifactId")]
        artifact_id: String,
        name: String,
        #[serde(rename = "artifactType")]
        artifact_type: ArtifactType,
    },
    ArtifactAnalysisComplete {
        #[serde(rename = "taskId")]
        task_id: String,
        created: bool,
    },
    /// Terminal success event for one task.
    TaskCompleted {
        #[serde(rename = "taskId")]
        task_id: String,
        status: TaskStatus,
        result: String,
    },
    /// Terminal failure event for one task (or a batch-level fault when
    /// `task_id` is absent).
    Error {
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        error: String,
    },
    TaskSelected {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    /// Emitted once at the start of a batch so the client can begin
    /// heartbeating with this identifier.
    Connection {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    /// Terminal for the stream: execution halted at a safe checkpoint.
    Paused { reason: PauseReason },
    /// Terminal for the stream: every task in the batch was processed.
    Done { summary: ExecutionSummary },
}

impl ExecutionEvent {
    /// SSE event name / log event tag.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Content { .. } => "content",
            ExecutionEvent::ToolCall { .. } => "tool_call",
            ExecutionEvent::ToolResult { .. } => "tool_result",
            ExecutionEvent::ArtifactAnalysisStart { .. } => "artifact_analysis_start",
            ExecutionEvent::ArtifactCreated { .. } => "artifact_created",
            ExecutionEvent::ArtifactAnalysisComplete { .. } => "artifact_analysis_complete",
            ExecutionEvent::TaskCompleted { .. } => "task_completed",
            ExecutionEvent::Error { .. } => "error",
            ExecutionEvent::TaskSelected { .. } => "task_selected",
            ExecutionEvent::Connection { .. } => "connection",
            ExecutionEvent::Paused { .. } => "paused",
            ExecutionEvent::Done { .. } => "done",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::Content { task_id, .. }
            | ExecutionEvent::ToolCall { task_id, .. }
            | ExecutionEvent::ToolResult { task_id, .. }
            | ExecutionEvent::ArtifactAnalysisStart { task_id }
            | ExecutionEvent::ArtifactCreated { task_id, .. }
            | ExecutionEvent::ArtifactAnalysisComplete { task_id, .. }
            | ExecutionEvent::TaskCompleted { task_id, .. }
            | ExecutionEvent::TaskSelected { task_id } => Some(task_id),
            ExecutionEvent::Error { task_id, .. } => task_id.as_deref(),
            ExecutionEvent::Connection { .. }
            | ExecutionEvent::Paused { .. }
            | ExecutionEvent::Done { .. } => None,
        }
    }

    /// Streaming content deltas and the connection handshake are skipped;
    /// they add nothing on replay.
    pub fn should_persist(&self) -> bool {
        !matches!(
            self,
            ExecutionEvent::Content { .. } | ExecutionEvent::Connection { .. }
        )
    }
}

/// Events from the thin planning collaborator's chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanningEvent {
    Content { content: String },
    TasksExtracting,
    TasksUpdated { tasks: Vec<crate::Task> },
    Done,
    Error { error: String },
}

impl PlanningEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlanningEvent::Content { .. } => "content",
            PlanningEvent::TasksExtracting => "tasks_extracting",
            PlanningEvent::TasksUpdated { .. } => "tasks_updated",
            PlanningEvent::Done => "done",
            PlanningEvent::Error { .. } => "error",
        }
    }
}
