//! Execution engine: the per-task agent workflow, the batch orchestrator
//! with its connection-liveness checkpoints, thread repair for interrupted
//! runs, and the thin planning collaborator.

pub mod event_bus;
pub mod orchestrator;
pub mod planner;
pub mod repair;
pub mod workflow;

pub use event_bus::{EventBus, SessionEvent};
pub use orchestrator::{ExecuteError, Orchestrator, OrchestratorConfig};
pub use planner::Planner;
pub use workflow::TaskWorkflow;

/// Char-safe truncation with an explicit marker, used for event payloads and
/// thread checkpoints.
pub(crate) fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out = input.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}
