use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use cadence_observability::{emit_event, ObservabilityEvent};
use cadence_store::{ConnectionStatus, ConnectionStore, ExecutionLogStore, SessionStore, TaskStore};
use cadence_types::{
    ExecutionEvent, ExecutionSummary, PauseReason, PriorTaskResult, SessionStatus, TaskStatus,
};

use crate::event_bus::EventBus;
use crate::workflow::TaskWorkflow;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// A heartbeat older than this reads as a client disconnect at the next
    /// safe checkpoint.
    pub heartbeat_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
pub enum ExecuteError {
    SessionNotFound(String),
    InvalidStatus {
        session_id: String,
        status: SessionStatus,
    },
    NoTasks(String),
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::SessionNotFound(id) => write!(f, "session {id} not found"),
            ExecuteError::InvalidStatus { session_id, status } => {
                write!(f, "session {session_id} cannot execute from status {status}")
            }
            ExecuteError::NoTasks(id) => {
                write!(f, "session {id} has no tasks to execute")
            }
        }
    }
}

impl std::error::Error for ExecuteError {}

/// Drives one execution batch: claims the session, registers the connection,
/// runs resumable tasks in order through the workflow, and pauses at the
/// nearest safe checkpoint when the connection goes quiet.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    workflow: TaskWorkflow,
    sessions: Arc<SessionStore>,
    tasks: Arc<TaskStore>,
    connections: Arc<ConnectionStore>,
    log: Arc<ExecutionLogStore>,
    events: EventBus,
}

/// Safety net for a dropped execution stream: when the consumer goes away
/// without reaching a terminal event, the session is parked in `Paused` and a
/// pause entry is logged so the client can resume later.
struct PauseOnDrop {
    armed: bool,
    session_id: String,
    sessions: Arc<SessionStore>,
    log: Arc<ExecutionLogStore>,
}

impl PauseOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PauseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session_id = self.session_id.clone();
        let sessions = self.sessions.clone();
        let log = self.log.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = sessions.set_status(&session_id, SessionStatus::Paused).await {
                    tracing::warn!(session_id, error = %err, "pause-on-drop status update failed");
                }
                let entry = ExecutionEvent::Paused {
                    reason: PauseReason::ClientDisconnected,
                };
                if let Err(err) = log.append(&session_id, entry).await {
                    tracing::warn!(session_id, error = %err, "pause-on-drop log append failed");
                }
            });
        }
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        workflow: TaskWorkflow,
        sessions: Arc<SessionStore>,
        tasks: Arc<TaskStore>,
        connections: Arc<ConnectionStore>,
        log: Arc<ExecutionLogStore>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            workflow,
            sessions,
            tasks,
            connections,
            log,
            events,
        }
    }

    /// Claims the session and returns the batch event stream. The stream ends
    /// with exactly one of `Paused` or `Done`; a batch-level `Error` before
    /// the first task also terminates it.
    pub async fn execute(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>, ExecuteError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| ExecuteError::SessionNotFound(session_id.to_string()))?;
        if !session.status.can_execute() {
            return Err(ExecuteError::InvalidStatus {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        if self.tasks.get_resumable(session_id).await.is_empty() {
            return Err(ExecuteError::NoTasks(session_id.to_string()));
        }

        if let Err(err) = self
            .sessions
            .set_status(session_id, SessionStatus::Executing)
            .await
        {
            tracing::warn!(session_id, error = %err, "could not mark session executing");
        }

        let connection_id = Uuid::new_v4().to_string();
        if let Err(err) = self.connections.register(session_id, &connection_id).await {
            tracing::warn!(session_id, error = %err, "connection registration flush failed");
        }
        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "batch.start",
                component: "core.orchestrator",
                session_id: Some(session_id),
                task_id: None,
                connection_id: Some(&connection_id),
                status: Some("start"),
                detail: None,
            },
        );

        let this = self.clone();
        let session_id = session_id.to_string();
        Ok(Box::pin(stream! {
            let mut guard = PauseOnDrop {
                armed: true,
                session_id: session_id.clone(),
                sessions: this.sessions.clone(),
                log: this.log.clone(),
            };

            yield this
                .emit(&session_id, ExecutionEvent::Connection {
                    connection_id: connection_id.clone(),
                })
                .await;

            let batch_time = Utc::now().format("%A, %B %d, %Y at %H:%M UTC").to_string();
            let prior_tasks = this.tasks.list_for_session(&session_id).await;
            let prior_failed = prior_tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .count();
            let mut prior_results = prior_tasks
                .into_iter()
                .filter(|t| t.status == TaskStatus::Done)
                .map(|t| PriorTaskResult {
                    title: t.title,
                    result: t.result.unwrap_or_default(),
                })
                .collect::<Vec<_>>();

            let batch = this.tasks.get_resumable(&session_id).await;
            // The summary spans the whole session, so tasks finished before
            // an earlier pause count on both sides of the tally.
            let total = batch.len() + prior_results.len() + prior_failed;
            let mut completed = prior_results.len();
            let mut failed = prior_failed;

            for task in batch {
                if let Some(reason) = this.liveness(&session_id, &connection_id).await {
                    this.pause(&session_id, &connection_id, reason, &mut guard).await;
                    yield this.emit(&session_id, ExecutionEvent::Paused { reason }).await;
                    return;
                }

                yield this
                    .emit(&session_id, ExecutionEvent::TaskSelected {
                        task_id: task.id.clone(),
                    })
                    .await;

                let task_title = task.title.clone();
                let mut task_result: Option<String> = None;
                // Counts tool calls whose result has not streamed back yet.
                // A checkpoint is only safe while this is zero: pausing with
                // a pending invocation would interleave a pause between a
                // tool call and its result.
                let mut pending_invocations = 0usize;
                {
                    let inner = this.workflow.run(
                        task,
                        prior_results.clone(),
                        batch_time.clone(),
                        cancel.clone(),
                    );
                    tokio::pin!(inner);
                    while let Some(event) = inner.next().await {
                        match &event {
                            ExecutionEvent::ToolCall { .. } => pending_invocations += 1,
                            ExecutionEvent::ToolResult { .. } => {
                                pending_invocations = pending_invocations.saturating_sub(1)
                            }
                            ExecutionEvent::TaskCompleted { result, .. } => {
                                completed += 1;
                                task_result = Some(result.clone());
                            }
                            ExecutionEvent::Error { .. } => failed += 1,
                            _ => {}
                        }
                        yield this.emit(&session_id, event).await;

                        if pending_invocations == 0 {
                            if let Some(reason) =
                                this.liveness(&session_id, &connection_id).await
                            {
                                // Dropping the inner stream here stops the
                                // run before its next provider call; the task
                                // stays in_progress for resume.
                                this.pause(&session_id, &connection_id, reason, &mut guard)
                                    .await;
                                yield this
                                    .emit(&session_id, ExecutionEvent::Paused { reason })
                                    .await;
                                return;
                            }
                        }
                    }
                }
                if let Some(result) = task_result {
                    prior_results.push(PriorTaskResult {
                        title: task_title,
                        result,
                    });
                }
            }

            if let Err(err) = this
                .sessions
                .set_status(&session_id, SessionStatus::Completed)
                .await
            {
                tracing::warn!(session_id, error = %err, "could not mark session completed");
            }
            guard.disarm();
            if let Err(err) = this.connections.clear(&session_id, &connection_id).await {
                tracing::warn!(session_id, error = %err, "connection clear flush failed");
            }
            emit_event(
                Level::INFO,
                ObservabilityEvent {
                    event: "batch.finish",
                    component: "core.orchestrator",
                    session_id: Some(&session_id),
                    task_id: None,
                    connection_id: Some(&connection_id),
                    status: Some("ok"),
                    detail: None,
                },
            );
            yield this
                .emit(&session_id, ExecutionEvent::Done {
                    summary: ExecutionSummary {
                        total,
                        completed,
                        failed,
                    },
                })
                .await;
        }))
    }

    async fn liveness(&self, session_id: &str, connection_id: &str) -> Option<PauseReason> {
        match self
            .connections
            .check_status(session_id, connection_id, self.config.heartbeat_timeout)
            .await
        {
            ConnectionStatus::Active => None,
            ConnectionStatus::Inactive(reason) => Some(reason),
        }
    }

    /// The connection record is deliberately left behind on pause; the next
    /// claim or register supersedes it.
    async fn pause(
        &self,
        session_id: &str,
        connection_id: &str,
        reason: PauseReason,
        guard: &mut PauseOnDrop,
    ) {
        if let Err(err) = self
            .sessions
            .set_status(session_id, SessionStatus::Paused)
            .await
        {
            tracing::warn!(session_id, error = %err, "could not mark session paused");
        }
        guard.disarm();
        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "batch.pause",
                component: "core.orchestrator",
                session_id: Some(session_id),
                task_id: None,
                connection_id: Some(connection_id),
                status: Some(reason.as_str()),
                detail: None,
            },
        );
    }

    /// Logs (subject to the persistence filter), publishes to the bus, and
    /// hands the event back for the SSE stream.
    async fn emit(&self, session_id: &str, event: ExecutionEvent) -> ExecutionEvent {
        if let Err(err) = self.log.append(session_id, event.clone()).await {
            tracing::warn!(session_id, error = %err, "execution log append failed");
        }
        self.events.publish(session_id, event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedProvider};
    use cadence_providers::ProviderRegistry;
    use cadence_store::{ArtifactStore, ThreadStore};
    use cadence_tools::ToolRegistry;
    use cadence_types::TaskDraft;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;

    struct Fixture {
        orchestrator: Orchestrator,
        sessions: Arc<SessionStore>,
        tasks: Arc<TaskStore>,
        connections: Arc<ConnectionStore>,
        log: Arc<ExecutionLogStore>,
        session_id: String,
    }

    fn temp_base(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cadence-orch-{tag}-{}", Uuid::new_v4()))
    }

    async fn fixture(
        provider: StdArc<ScriptedProvider>,
        titles: &[&str],
        tag: &str,
    ) -> Fixture {
        let base = temp_base(tag);
        let sessions = Arc::new(SessionStore::new(&base).await.expect("sessions"));
        let tasks = Arc::new(TaskStore::new(&base).await.expect("tasks"));
        let threads = Arc::new(ThreadStore::new(&base).await.expect("threads"));
        let artifacts = Arc::new(ArtifactStore::new(&base).await.expect("artifacts"));
        let connections = Arc::new(ConnectionStore::new(&base).await.expect("connections"));
        let log = Arc::new(ExecutionLogStore::new(&base).await.expect("log"));

        let session = sessions
            .create(Some("batch under test".to_string()))
            .await
            .expect("session");
        let drafts = titles
            .iter()
            .map(|t| TaskDraft {
                title: t.to_string(),
                description: None,
            })
            .collect();
        tasks
            .create_many(&session.id, drafts)
            .await
            .expect("tasks");

        let workflow = TaskWorkflow::new(
            ProviderRegistry::with_providers(vec![provider]),
            ToolRegistry::empty(),
            tasks.clone(),
            threads,
            artifacts,
        );
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            workflow,
            sessions.clone(),
            tasks.clone(),
            connections.clone(),
            log.clone(),
            EventBus::new(),
        );
        Fixture {
            orchestrator,
            sessions,
            tasks,
            connections,
            log,
            session_id: session.id,
        }
    }

    async fn run_to_end(fixture: &Fixture) -> Vec<ExecutionEvent> {
        fixture
            .orchestrator
            .execute(&fixture.session_id, CancellationToken::new())
            .await
            .expect("execute")
            .collect()
            .await
    }

    #[tokio::test]
    async fn batch_runs_every_task_to_done() {
        let provider = ScriptedProvider::new(vec![
            Reply::Text("first result".to_string()),
            Reply::Text(r#"{"create": false}"#.to_string()),
            Reply::Text("second result".to_string()),
            Reply::Text(r#"{"create": false}"#.to_string()),
        ]);
        let fixture = fixture(provider, &["one", "two"], "full").await;

        let events = run_to_end(&fixture).await;
        assert_eq!(events.first().map(|e| e.name()), Some("connection"));
        let summary = match events.last() {
            Some(ExecutionEvent::Done { summary }) => *summary,
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);

        let session = fixture.sessions.get(&fixture.session_id).await.expect("session");
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(fixture.connections.get(&fixture.session_id).await.is_none());
        for task in fixture.tasks.list_for_session(&fixture.session_id).await {
            assert_eq!(task.status, TaskStatus::Done);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseding_connection_pauses_at_the_next_checkpoint() {
        let connections_cell: StdArc<std::sync::Mutex<Option<Arc<ConnectionStore>>>> =
            StdArc::new(std::sync::Mutex::new(None));
        let calls = StdArc::new(std::sync::atomic::AtomicUsize::new(0));
        let session_cell: StdArc<std::sync::Mutex<String>> =
            StdArc::new(std::sync::Mutex::new(String::new()));

        let hook_cell = connections_cell.clone();
        let hook_calls = calls.clone();
        let hook_session = session_cell.clone();
        let provider = ScriptedProvider::with_hook(
            vec![
                Reply::Text("first".to_string()),
                Reply::Text("never reached".to_string()),
            ],
            Box::new(move || {
                // During the first task's model call, a second client claims
                // the session with a fresh connection identifier.
                if hook_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    let connections = hook_cell
                        .lock()
                        .expect("cell")
                        .clone()
                        .expect("connections set");
                    let session_id = hook_session.lock().expect("session").clone();
                    let handle = tokio::runtime::Handle::current();
                    tokio::task::block_in_place(move || {
                        handle.block_on(async move {
                            connections
                                .register(&session_id, "rival-connection")
                                .await
                                .expect("register");
                        });
                    });
                }
            }),
        );

        let fixture = fixture(provider, &["one", "two"], "supersede").await;
        *connections_cell.lock().expect("cell") = Some(fixture.connections.clone());
        *session_cell.lock().expect("session") = fixture.session_id.clone();

        let events = run_to_end(&fixture).await;
        let reason = match events.last() {
            Some(ExecutionEvent::Paused { reason }) => *reason,
            other => panic!("expected paused, got {other:?}"),
        };
        assert_eq!(reason, PauseReason::ClientDisconnected);

        let session = fixture.sessions.get(&fixture.session_id).await.expect("session");
        assert_eq!(session.status, SessionStatus::Paused);
        // The rival's registration survives; the paused run must not clear it.
        let record = fixture.connections.get(&fixture.session_id).await.expect("record");
        assert_eq!(record.connection_id, "rival-connection");
        // Interrupted mid-task: the first task stays claimed for the resume
        // and the second never started.
        let tasks = fixture.tasks.list_for_session(&fixture.session_id).await;
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_request_lands_after_the_tool_result() {
        let connections_cell: StdArc<std::sync::Mutex<Option<Arc<ConnectionStore>>>> =
            StdArc::new(std::sync::Mutex::new(None));
        let calls = StdArc::new(std::sync::atomic::AtomicUsize::new(0));
        let session_cell: StdArc<std::sync::Mutex<String>> =
            StdArc::new(std::sync::Mutex::new(String::new()));

        let hook_cell = connections_cell.clone();
        let hook_calls = calls.clone();
        let hook_session = session_cell.clone();
        let provider = ScriptedProvider::with_hook(
            vec![
                Reply::ToolCall {
                    name: "missing_tool".to_string(),
                    args: json!({}),
                },
                Reply::Text("unreachable".to_string()),
            ],
            Box::new(move || {
                if hook_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    let connections = hook_cell
                        .lock()
                        .expect("cell")
                        .clone()
                        .expect("connections set");
                    let session_id = hook_session.lock().expect("session").clone();
                    let handle = tokio::runtime::Handle::current();
                    tokio::task::block_in_place(move || {
                        handle.block_on(async move {
                            connections
                                .request_pause(&session_id)
                                .await
                                .expect("request pause");
                        });
                    });
                }
            }),
        );

        let fixture = fixture(provider, &["one"], "midtask").await;
        *connections_cell.lock().expect("cell") = Some(fixture.connections.clone());
        *session_cell.lock().expect("session") = fixture.session_id.clone();

        let events = run_to_end(&fixture).await;
        let names = events.iter().map(|e| e.name()).collect::<Vec<_>>();
        let call = names.iter().position(|n| *n == "tool_call").expect("tool_call");
        let result = names.iter().position(|n| *n == "tool_result").expect("tool_result");
        let paused = names.iter().position(|n| *n == "paused").expect("paused");
        assert!(call < result);
        assert!(result < paused);
        assert_eq!(names.last(), Some(&"paused"));
        match &events[paused] {
            ExecutionEvent::Paused { reason } => {
                assert_eq!(*reason, PauseReason::UserRequested)
            }
            other => panic!("expected paused, got {other:?}"),
        }

        // Interrupted mid-task: the task stays claimed for the resume.
        let tasks = fixture.tasks.list_for_session(&fixture.session_id).await;
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn log_keeps_terminal_events_but_not_content() {
        let provider = ScriptedProvider::new(vec![
            Reply::Text("streamed text".to_string()),
            Reply::Text(r#"{"create": false}"#.to_string()),
        ]);
        let fixture = fixture(provider, &["one"], "log").await;

        run_to_end(&fixture).await;

        let entries = fixture.log.list(&fixture.session_id, usize::MAX, 0).await;
        let names = entries.iter().map(|e| e.event.name()).collect::<Vec<_>>();
        assert!(!names.contains(&"content"));
        assert!(!names.contains(&"connection"));
        assert!(names.contains(&"task_selected"));
        assert!(names.contains(&"task_completed"));
        assert!(names.contains(&"done"));
    }

    #[tokio::test]
    async fn execute_rejects_a_completed_session() {
        let provider = ScriptedProvider::new(vec![]);
        let fixture = fixture(provider, &["one"], "reject").await;
        fixture
            .sessions
            .set_status(&fixture.session_id, SessionStatus::Completed)
            .await
            .expect("status");

        let err = fixture
            .orchestrator
            .execute(&fixture.session_id, CancellationToken::new())
            .await
            .err()
            .expect("error");
        match err {
            ExecuteError::InvalidStatus { status, .. } => {
                assert_eq!(status, SessionStatus::Completed)
            }
            other => panic!("expected invalid status, got {other}"),
        }

        let err = fixture
            .orchestrator
            .execute("no-such-session", CancellationToken::new())
            .await
            .err()
            .expect("error");
        assert!(matches!(err, ExecuteError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn execute_rejects_a_session_without_tasks() {
        let provider = ScriptedProvider::new(vec![]);
        let fixture = fixture(provider, &[], "empty").await;

        let err = fixture
            .orchestrator
            .execute(&fixture.session_id, CancellationToken::new())
            .await
            .err()
            .expect("error");
        assert!(matches!(err, ExecuteError::NoTasks(_)));
        // The rejected claim must not touch the session status.
        let session = fixture.sessions.get(&fixture.session_id).await.expect("session");
        assert_eq!(session.status, SessionStatus::Planning);
    }

    #[tokio::test]
    async fn resume_counts_a_prior_failure_in_the_summary() {
        let provider = ScriptedProvider::new(vec![
            Reply::Text("second result".to_string()),
            Reply::Text(r#"{"create": false}"#.to_string()),
        ]);
        let fixture = fixture(provider, &["one", "two"], "prior-fail").await;
        let tasks = fixture.tasks.list_for_session(&fixture.session_id).await;
        fixture.tasks.start(&tasks[0].id).await.expect("start");
        fixture
            .tasks
            .fail(&tasks[0].id, "provider unavailable".to_string())
            .await
            .expect("fail");
        fixture
            .sessions
            .set_status(&fixture.session_id, SessionStatus::Paused)
            .await
            .expect("status");

        let events = run_to_end(&fixture).await;
        let summary = match events.last() {
            Some(ExecutionEvent::Done { summary }) => *summary,
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn resume_skips_finished_tasks_and_counts_them() {
        let provider = ScriptedProvider::new(vec![
            Reply::Text("second result".to_string()),
            Reply::Text(r#"{"create": false}"#.to_string()),
        ]);
        let fixture = fixture(provider, &["one", "two"], "resume").await;
        let tasks = fixture.tasks.list_for_session(&fixture.session_id).await;
        fixture.tasks.start(&tasks[0].id).await.expect("start");
        fixture
            .tasks
            .complete(&tasks[0].id, "first result".to_string())
            .await
            .expect("complete");
        fixture
            .sessions
            .set_status(&fixture.session_id, SessionStatus::Paused)
            .await
            .expect("status");

        let events = run_to_end(&fixture).await;
        let selected = events
            .iter()
            .filter(|e| e.name() == "task_selected")
            .count();
        assert_eq!(selected, 1);
        let summary = match events.last() {
            Some(ExecutionEvent::Done { summary }) => *summary,
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 2);
    }
}
