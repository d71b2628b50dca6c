//! Repair for conversation threads that were interrupted mid tool call.
//!
//! A thread is invalid to resume when its last agent turn requested tool
//! invocations that never received tool turns (the process died between the
//! request and the result). Repair synthesizes a sentinel tool turn for each
//! unanswered invocation so the provider sees a well-formed conversation.

use std::collections::HashSet;

use cadence_store::ThreadStore;
use cadence_types::Turn;

pub const INTERRUPTED_SENTINEL: &str =
    "Tool execution was interrupted before a result was recorded. \
     Re-run the tool if its output is still needed.";

/// Appends sentinel tool turns for unanswered invocations of the last agent
/// turn that requested any. Returns how many were synthesized. Idempotent:
/// once every invocation has a matching tool turn, this is a no-op.
pub fn repair_turns(turns: &mut Vec<Turn>) -> usize {
    let Some((index, invocations)) = turns.iter().enumerate().rev().find_map(|(i, turn)| {
        let invocations = turn.invocations();
        if invocations.is_empty() {
            None
        } else {
            Some((i, invocations.to_vec()))
        }
    }) else {
        return 0;
    };

    let answered = turns[index + 1..]
        .iter()
        .filter_map(|turn| match turn {
            Turn::Tool { invocation_id, .. } => Some(invocation_id.as_str()),
            _ => None,
        })
        .collect::<HashSet<_>>();

    let missing = invocations
        .into_iter()
        .filter(|invocation| !answered.contains(invocation.id.as_str()))
        .collect::<Vec<_>>();
    for invocation in &missing {
        turns.push(Turn::Tool {
            invocation_id: invocation.id.clone(),
            tool: invocation.name.clone(),
            content: INTERRUPTED_SENTINEL.to_string(),
        });
    }
    missing.len()
}

/// Loads, repairs, and (when anything changed) persists one thread.
pub async fn repair_thread(threads: &ThreadStore, thread_id: &str) -> anyhow::Result<usize> {
    let mut turns = threads.load(thread_id).await;
    let repaired = repair_turns(&mut turns);
    if repaired > 0 {
        threads.save(thread_id, turns).await?;
    }
    Ok(repaired)
}

/// Repair must never block a resume: faults are logged and execution
/// proceeds with the thread as loaded.
pub async fn repair_thread_best_effort(threads: &ThreadStore, thread_id: &str) -> usize {
    match repair_thread(threads, thread_id).await {
        Ok(repaired) => {
            if repaired > 0 {
                tracing::info!(thread_id, repaired, "synthesized tool turns for interrupted thread");
            }
            repaired
        }
        Err(err) => {
            tracing::warn!(thread_id, error = %err, "thread repair failed, resuming as-is");
            0
        }
    }
}
