use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use cadence_observability::{emit_event, ObservabilityEvent};
use cadence_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use cadence_store::{ArtifactStore, TaskStore, ThreadStore};
use cadence_tools::{validate_tool_schemas, ToolRegistry};
use cadence_types::{
    execution_thread_id, ArtifactType, ExecutionEvent, PriorTaskResult, Task, TaskStatus,
    ToolInvocation, Turn,
};

use crate::{repair, truncate_text};

/// Agent turns per task before the loop gives up and treats the accumulated
/// text as the result.
const MAX_AGENT_ITERATIONS: usize = 25;
/// Tool output cap inside events pushed to the client.
const EVENT_OUTPUT_LIMIT: usize = 500;
/// Tool output cap inside the persisted thread.
const THREAD_OUTPUT_LIMIT: usize = 16_000;
/// Result excerpt handed to the artifact decision prompt.
const DECISION_RESULT_LIMIT: usize = 4_000;

#[derive(Default)]
struct StreamedToolCall {
    id: String,
    name: String,
    args: String,
}

/// Runs one task to a terminal event: a provider-driven agent loop with tool
/// execution, thread checkpointing after every turn, and an artifact decision
/// for non-empty results.
#[derive(Clone)]
pub struct TaskWorkflow {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    tasks: Arc<TaskStore>,
    threads: Arc<ThreadStore>,
    artifacts: Arc<ArtifactStore>,
}

impl TaskWorkflow {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        tasks: Arc<TaskStore>,
        threads: Arc<ThreadStore>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            providers,
            tools,
            tasks,
            threads,
            artifacts,
        }
    }

    /// The returned stream ends with exactly one terminal event for the
    /// task: `TaskCompleted` or `Error`. Dropping the stream mid-flight or
    /// firing `cancel` leaves the task `in_progress` with its thread
    /// checkpointed, which is what resume and repair expect.
    pub fn run(
        &self,
        task: Task,
        prior_results: Vec<PriorTaskResult>,
        batch_time: String,
        cancel: CancellationToken,
    ) -> std::pin::Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>> {
        let this = self.clone();
        Box::pin(stream! {
            let task_id = task.id.clone();
            let session_id = task.session_id.clone();
            emit_event(
                Level::INFO,
                ObservabilityEvent {
                    event: "task.run.start",
                    component: "core.workflow",
                    session_id: Some(&session_id),
                    task_id: Some(&task_id),
                    connection_id: None,
                    status: Some("start"),
                    detail: None,
                },
            );

            if let Err(err) = this.tasks.start(&task_id).await {
                yield ExecutionEvent::Error {
                    task_id: Some(task_id.clone()),
                    error: err.to_string(),
                };
                return;
            }

            let thread_id = execution_thread_id(&session_id, &task_id);
            repair::repair_thread_best_effort(&this.threads, &thread_id).await;
            let mut turns = this.threads.load(&thread_id).await;
            if turns.is_empty() {
                turns.push(Turn::User {
                    text: task_prompt(&task, &prior_results),
                });
            } else if !matches!(turns.last(), Some(Turn::User { .. })) {
                turns.push(Turn::User {
                    text: "Continue working on this task. Review the conversation so far \
                           and finish it."
                        .to_string(),
                });
            }
            if let Err(err) = this.threads.save(&thread_id, turns.clone()).await {
                tracing::warn!(error = %err, thread_id, "thread checkpoint failed");
            }

            let tool_schemas = this.tools.list().await;
            if let Err(err) = validate_tool_schemas(&tool_schemas) {
                yield fail_task(&this.tasks, &task_id, err.to_string()).await;
                return;
            }
            let system = ChatMessage::system(execution_system_prompt(&batch_time));

            let mut text = String::new();
            let mut iterations = 0usize;
            loop {
                if iterations >= MAX_AGENT_ITERATIONS || cancel.is_cancelled() {
                    break;
                }
                iterations += 1;

                let mut messages = vec![system.clone()];
                messages.extend(render_chat_messages(&turns));
                let stream = match this
                    .providers
                    .stream_for_provider(
                        None,
                        None,
                        messages,
                        Some(tool_schemas.clone()),
                        cancel.clone(),
                    )
                    .await
                {
                    Ok(stream) => stream,
                    Err(err) => {
                        yield fail_task(&this.tasks, &task_id, err.to_string()).await;
                        return;
                    }
                };
                tokio::pin!(stream);

                text.clear();
                let mut calls: Vec<StreamedToolCall> = Vec::new();
                let mut stream_error: Option<String> = None;
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            stream_error = Some(err.to_string());
                            break;
                        }
                    };
                    match chunk {
                        StreamChunk::TextDelta(delta) => {
                            text.push_str(&delta);
                            yield ExecutionEvent::Content {
                                task_id: task_id.clone(),
                                content: delta,
                            };
                        }
                        StreamChunk::ToolCallStart { id, name } => {
                            match calls.iter_mut().find(|c| c.id == id) {
                                Some(call) if call.name.is_empty() => call.name = name,
                                Some(_) => {}
                                None => calls.push(StreamedToolCall {
                                    id,
                                    name,
                                    args: String::new(),
                                }),
                            }
                        }
                        StreamChunk::ToolCallDelta { id, args_delta } => {
                            match calls.iter_mut().find(|c| c.id == id) {
                                Some(call) => call.args.push_str(&args_delta),
                                None => calls.push(StreamedToolCall {
                                    id,
                                    name: String::new(),
                                    args: args_delta,
                                }),
                            }
                        }
                        StreamChunk::ToolCallEnd { .. } => {}
                        StreamChunk::Done { .. } => break,
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                if let Some(error) = stream_error {
                    yield fail_task(&this.tasks, &task_id, error).await;
                    return;
                }

                let invocations = calls
                    .into_iter()
                    .filter(|call| !call.name.trim().is_empty())
                    .map(|call| ToolInvocation {
                        id: if call.id.is_empty() {
                            format!("call-{}", uuid::Uuid::new_v4())
                        } else {
                            call.id
                        },
                        name: call.name.trim().to_string(),
                        args: parse_streamed_args(&call.args),
                    })
                    .collect::<Vec<_>>();

                turns.push(Turn::Agent {
                    text: text.clone(),
                    invocations: invocations.clone(),
                });
                if let Err(err) = this.threads.save(&thread_id, turns.clone()).await {
                    tracing::warn!(error = %err, thread_id, "thread checkpoint failed");
                }

                if cancel.is_cancelled() {
                    return;
                }
                if invocations.is_empty() {
                    break;
                }

                for invocation in invocations {
                    yield ExecutionEvent::ToolCall {
                        task_id: task_id.clone(),
                        tool: invocation.name.clone(),
                        input: invocation.args.clone(),
                    };
                    let result = match this
                        .tools
                        .execute_with_cancel(
                            &invocation.name,
                            invocation.args.clone(),
                            cancel.clone(),
                        )
                        .await
                    {
                        Ok(result) => result,
                        Err(err) => {
                            // The unanswered invocation stays in the thread;
                            // repair synthesizes its tool turn on resume.
                            yield fail_task(&this.tasks, &task_id, err.to_string()).await;
                            return;
                        }
                    };
                    turns.push(Turn::Tool {
                        invocation_id: invocation.id.clone(),
                        tool: invocation.name.clone(),
                        content: truncate_text(&result.output, THREAD_OUTPUT_LIMIT),
                    });
                    if let Err(err) = this.threads.save(&thread_id, turns.clone()).await {
                        tracing::warn!(error = %err, thread_id, "thread checkpoint failed");
                    }
                    yield ExecutionEvent::ToolResult {
                        task_id: task_id.clone(),
                        tool: invocation.name,
                        output: truncate_text(&result.output, EVENT_OUTPUT_LIMIT),
                    };
                }
            }

            // Cancellation is a disconnect, not a completion: the task keeps
            // its in_progress claim and its checkpointed thread for resume.
            if cancel.is_cancelled() {
                return;
            }

            let result = text.trim().to_string();
            if !result.is_empty() {
                yield ExecutionEvent::ArtifactAnalysisStart {
                    task_id: task_id.clone(),
                };
                match this.decide_artifact(&task, &result).await {
                    Some(artifact) => {
                        yield ExecutionEvent::ArtifactCreated {
                            task_id: task_id.clone(),
                            artifact_id: artifact.id,
                            name: artifact.name,
                            artifact_type: artifact.artifact_type,
                        };
                    }
                    None => {
                        yield ExecutionEvent::ArtifactAnalysisComplete {
                            task_id: task_id.clone(),
                            created: false,
                        };
                    }
                }
            }

            match this.tasks.complete(&task_id, result.clone()).await {
                Ok(_) => {
                    emit_event(
                        Level::INFO,
                        ObservabilityEvent {
                            event: "task.run.finish",
                            component: "core.workflow",
                            session_id: Some(&session_id),
                            task_id: Some(&task_id),
                            connection_id: None,
                            status: Some("ok"),
                            detail: None,
                        },
                    );
                    yield ExecutionEvent::TaskCompleted {
                        task_id: task_id.clone(),
                        status: TaskStatus::Done,
                        result,
                    };
                }
                Err(err) => {
                    yield ExecutionEvent::Error {
                        task_id: Some(task_id.clone()),
                        error: err.to_string(),
                    };
                }
            }
        })
    }

    /// Asks the provider whether the result deserves a user-facing artifact.
    /// Any fault here (provider error, malformed JSON, validation) downgrades
    /// to "no artifact"; the task result itself is never at risk.
    async fn decide_artifact(&self, task: &Task, result: &str) -> Option<cadence_types::Artifact> {
        if let Some(existing) = self
            .artifacts
            .find_for_task(&task.session_id, &task.id)
            .await
        {
            tracing::debug!(task_id = %task.id, artifact_id = %existing.id, "artifact already exists for task");
            return None;
        }

        let prompt = artifact_decision_prompt(task, result);
        let reply = match self.providers.complete_for_provider(None, &prompt, None).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "artifact decision call failed");
                return None;
            }
        };
        let decision = match parse_artifact_decision(&reply) {
            Some(decision) => decision,
            None => {
                tracing::warn!(task_id = %task.id, "artifact decision reply was not parseable");
                return None;
            }
        };
        if !decision.create {
            return None;
        }

        match self
            .artifacts
            .create(
                &task.session_id,
                Some(&task.id),
                &decision.name,
                decision.artifact_type,
                result.to_string(),
            )
            .await
        {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "artifact creation failed");
                None
            }
        }
    }
}

struct ArtifactDecision {
    create: bool,
    name: String,
    artifact_type: ArtifactType,
}

fn execution_system_prompt(batch_time: &str) -> String {
    format!(
        "You are an execution agent working through one task from a planned task list.\n\
         Current time: {batch_time}.\n\
         Use the available tools when they help. When the task is finished, reply with a \
         clear, self-contained result and no further tool calls."
    )
}

fn task_prompt(task: &Task, prior_results: &[PriorTaskResult]) -> String {
    let mut prompt = format!("Task: {}", task.title);
    if let Some(description) = task.description.as_deref() {
        if !description.trim().is_empty() {
            prompt.push_str(&format!("\n\nDetails: {description}"));
        }
    }
    if !prior_results.is_empty() {
        prompt.push_str("\n\nResults from earlier tasks in this session:");
        for prior in prior_results {
            prompt.push_str(&format!(
                "\n- {}: {}",
                prior.title,
                truncate_text(&prior.result, 2_000)
            ));
        }
    }
    prompt
}

fn artifact_decision_prompt(task: &Task, result: &str) -> String {
    format!(
        "A task just completed.\nTask: {}\nResult:\n{}\n\n\
         Decide whether this result should be saved as a standalone user-facing artifact \
         (a document the user would want to keep, not a short status update).\n\
         Respond with JSON only, no prose: \
         {{\"create\": true|false, \"name\": \"short artifact name\", \
         \"type\": \"document|note|summary|plan|other\"}}",
        task.title,
        truncate_text(result, DECISION_RESULT_LIMIT)
    )
}

fn parse_artifact_decision(reply: &str) -> Option<ArtifactDecision> {
    let block = extract_first_json_object(reply)?;
    let value = serde_json::from_str::<Value>(&block).ok()?;
    let create = value.get("create").and_then(|v| v.as_bool())?;
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("Untitled artifact")
        .trim()
        .to_string();
    let artifact_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(ArtifactType::parse_lenient)
        .unwrap_or(ArtifactType::Other);
    Some(ArtifactDecision {
        create,
        name: if name.is_empty() {
            "Untitled artifact".to_string()
        } else {
            name
        },
        artifact_type,
    })
}

fn extract_first_json_object(input: &str) -> Option<String> {
    let start = input.find('{')?;
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
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
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

fn parse_streamed_args(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| json!({ "input": trimmed }))
}

/// The provider API only knows system/user/assistant roles, so tool turns
/// are rendered as user messages carrying the tool output.
pub(crate) fn render_chat_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::User { text } => ChatMessage::user(text.clone()),
            Turn::Agent { text, invocations } => {
                if text.trim().is_empty() && !invocations.is_empty() {
                    let called = invocations
                        .iter()
                        .map(|i| format!("[calling tool `{}`]", i.name))
                        .collect::<Vec<_>>()
                        .join("\n");
                    ChatMessage::assistant(called)
                } else {
                    ChatMessage::assistant(text.clone())
                }
            }
            Turn::Tool { tool, content, .. } => {
                ChatMessage::user(format!("Tool `{tool}` result:\n{content}"))
            }
        })
        .collect()
}

async fn fail_task(tasks: &TaskStore, task_id: &str, error: String) -> ExecutionEvent {
    if let Err(err) = tasks.fail(task_id, error.clone()).await {
        tracing::warn!(task_id, error = %err, "could not mark task failed");
    }
    ExecutionEvent::Error {
        task_id: Some(task_id.to_string()),
        error,
    }
}
