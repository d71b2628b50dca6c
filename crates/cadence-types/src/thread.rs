use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool call requested by the agent within one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One entry in a per-task conversation. An `Agent` turn may carry pending
/// tool invocations; each must be matched by exactly one `Tool` turn before
/// the conversation is valid to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Agent {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        invocations: Vec<ToolInvocation>,
    },
    Tool {
        #[serde(rename = "invocationID")]
        invocation_id: String,
        tool: String,
        content: String,
    },
}

impl Turn {
    pub fn invocations(&self) -> &[ToolInvocation] {
        match self {
            Turn::Agent { invocations, .. } => invocations,
            _ => &[],
        }
    }
}

/// Thread identifier for a task-scoped conversation checkpoint.
pub fn execution_thread_id(session_id: &str, task_id: &str) -> String {
    format!("execution_{session_id}_{task_id}")
}

/// Thread identifier for the session-scoped planning conversation.
pub fn planning_thread_id(session_id: &str) -> String {
    format!("planning_{session_id}")
}
