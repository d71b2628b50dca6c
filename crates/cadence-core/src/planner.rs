use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use cadence_store::{SessionStore, TaskStore, ThreadStore};
use cadence_types::{planning_thread_id, PlanningEvent, TaskDraft, Turn};

use crate::truncate_text;
use crate::workflow::render_chat_messages;

const PLANNING_SYSTEM_PROMPT: &str = "You are a planning assistant. Talk through the user's \
goal with them, ask clarifying questions when the goal is vague, and converge on a concrete, \
ordered list of tasks. Keep replies short and conversational; the task list itself is \
extracted separately.";

const DEFAULT_SESSION_TITLE: &str = "New Session";
const TITLE_MAX_CHARS: usize = 60;

/// Conversational planning over a per-session thread. Each exchange streams
/// the reply, then re-extracts the task list from the whole conversation.
#[derive(Clone)]
pub struct Planner {
    providers: ProviderRegistry,
    sessions: Arc<SessionStore>,
    tasks: Arc<TaskStore>,
    threads: Arc<ThreadStore>,
}

impl Planner {
    pub fn new(
        providers: ProviderRegistry,
        sessions: Arc<SessionStore>,
        tasks: Arc<TaskStore>,
        threads: Arc<ThreadStore>,
    ) -> Self {
        Self {
            providers,
            sessions,
            tasks,
            threads,
        }
    }

    pub fn chat(
        &self,
        session_id: &str,
        message: String,
        cancel: CancellationToken,
    ) -> std::pin::Pin<Box<dyn Stream<Item = PlanningEvent> + Send>> {
        let this = self.clone();
        let session_id = session_id.to_string();
        Box::pin(stream! {
            let thread_id = planning_thread_id(&session_id);
            let mut turns = this.threads.load(&thread_id).await;
            turns.push(Turn::User {
                text: message.clone(),
            });
            if let Err(err) = this.threads.save(&thread_id, turns.clone()).await {
                tracing::warn!(error = %err, thread_id, "planning thread checkpoint failed");
            }

            let mut messages = vec![ChatMessage::system(PLANNING_SYSTEM_PROMPT.to_string())];
            messages.extend(render_chat_messages(&turns));
            let reply_stream = match this
                .providers
                .stream_for_provider(None, None, messages, None, cancel.clone())
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    yield PlanningEvent::Error {
                        error: err.to_string(),
                    };
                    return;
                }
            };
            tokio::pin!(reply_stream);

            let mut reply = String::new();
            while let Some(chunk) = reply_stream.next().await {
                match chunk {
                    Ok(StreamChunk::TextDelta(delta)) => {
                        reply.push_str(&delta);
                        yield PlanningEvent::Content { content: delta };
                    }
                    Ok(StreamChunk::Done { .. }) => break,
                    // Planning runs without tools; stray tool chunks are noise.
                    Ok(_) => {}
                    Err(err) => {
                        yield PlanningEvent::Error {
                            error: err.to_string(),
                        };
                        return;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }

            turns.push(Turn::Agent {
                text: reply.clone(),
                invocations: Vec::new(),
            });
            if let Err(err) = this.threads.save(&thread_id, turns.clone()).await {
                tracing::warn!(error = %err, thread_id, "planning thread checkpoint failed");
            }

            this.maybe_title_session(&session_id, &message).await;

            yield PlanningEvent::TasksExtracting;
            match this.extract_tasks(&turns).await {
                Ok(Some(drafts)) => {
                    if let Err(err) = this.tasks.delete_for_session(&session_id).await {
                        tracing::warn!(session_id, error = %err, "stale task cleanup failed");
                    }
                    match this.tasks.create_many(&session_id, drafts).await {
                        Ok(_) => {
                            let tasks = this.tasks.list_for_session(&session_id).await;
                            yield PlanningEvent::TasksUpdated { tasks };
                        }
                        Err(err) => {
                            yield PlanningEvent::Error {
                                error: err.to_string(),
                            };
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    yield PlanningEvent::Error {
                        error: err.to_string(),
                    };
                    return;
                }
            }

            yield PlanningEvent::Done;
        })
    }

    /// Re-reads the whole conversation and returns the current task list, or
    /// `None` when the reply carries no parseable list (an early exchange
    /// that is still clarifying the goal, typically).
    async fn extract_tasks(&self, turns: &[Turn]) -> anyhow::Result<Option<Vec<TaskDraft>>> {
        let transcript = turns
            .iter()
            .filter_map(|turn| match turn {
                Turn::User { text } => Some(format!("User: {text}")),
                Turn::Agent { text, .. } if !text.trim().is_empty() => {
                    Some(format!("Assistant: {text}"))
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "Here is a planning conversation:\n\n{}\n\n\
             Extract the agreed task list. Respond with a JSON array only, no prose: \
             [{{\"title\": \"...\", \"description\": \"...\"}}]. Order matters. \
             If no concrete tasks have been agreed yet, respond with [].",
            truncate_text(&transcript, 24_000)
        );
        let reply = self
            .providers
            .complete_for_provider(None, &prompt, None)
            .await?;
        let Some(block) = extract_first_json_array(&reply) else {
            tracing::warn!("task extraction reply carried no JSON array");
            return Ok(None);
        };
        let values = match serde_json::from_str::<Vec<Value>>(&block) {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(error = %err, "task extraction array did not parse");
                return Ok(None);
            }
        };
        let drafts = values
            .into_iter()
            .filter_map(|value| {
                let title = value.get("title")?.as_str()?.trim().to_string();
                if title.is_empty() {
                    return None;
                }
                let description = value
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                Some(TaskDraft { title, description })
            })
            .collect::<Vec<_>>();
        if drafts.is_empty() {
            return Ok(None);
        }
        Ok(Some(drafts))
    }

    /// First substantive message names the session, unless the user already
    /// renamed it.
    async fn maybe_title_session(&self, session_id: &str, message: &str) {
        let Some(session) = self.sessions.get(session_id).await else {
            return;
        };
        if session.title != DEFAULT_SESSION_TITLE {
            return;
        }
        let title = derive_title(message);
        if title.is_empty() {
            return;
        }
        if let Err(err) = self.sessions.set_title(session_id, title).await {
            tracing::warn!(session_id, error = %err, "session title update failed");
        }
    }
}

fn derive_title(message: &str) -> String {
    let first_line = message.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = first_line.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut title = trimmed
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();
    title.push_str("...");
    title
}

fn extract_first_json_array(input: &str) -> Option<String> {
    let start = input.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in input[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(input[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
