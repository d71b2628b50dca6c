use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use cadence_core::ExecuteError;
use cadence_types::{SessionStatus, Task};

use crate::{AppState, ServerConfig};

#[derive(Debug, Deserialize, Default)]
struct CreateSessionInput {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatInput {
    message: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatInput {
    #[serde(rename = "connectionId")]
    connection_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionLogQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "code": code, "error": message.into() })),
    )
}

fn session_not_found(id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        "session_not_found",
        format!("session {id} not found"),
    )
}

pub async fn run_http_server(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::build(&config).await?;
    let app = app_router(state);
    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "cadence server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/providers", get(list_providers))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/tasks", get(list_tasks))
        .route("/sessions/{id}/chat", post(chat))
        .route("/sessions/{id}/execute", post(execute))
        .route(
            "/sessions/{id}/execution-heartbeat",
            post(execution_heartbeat),
        )
        .route("/sessions/{id}/claim-execution", post(claim_execution))
        .route("/sessions/{id}/pause-execution", post(pause_execution))
        .route("/sessions/{id}/execution-logs", get(execution_logs))
        .route("/sessions/{id}/artifacts", get(list_artifacts))
        .route("/artifacts/{id}", get(get_artifact).delete(delete_artifact))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "providers": state.providers.list().await }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionInput>,
) -> Result<impl IntoResponse, ApiError> {
    let title = input.title.filter(|t| !t.trim().is_empty());
    let session = state.sessions.create(title).await.map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "session_create_failed",
            e.to_string(),
        )
    })?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.sessions.list().await }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    let tasks = state.tasks.list_for_session(&id).await;
    Ok(Json(json!({ "session": session, "tasks": tasks })))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    Ok(Json(state.tasks.list_for_session(&id).await))
}

/// Deleting a session removes everything hanging off it: tasks, artifacts,
/// the execution log, conversation threads, and any connection record.
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.sessions.delete(&id).await.map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "session_delete_failed",
            e.to_string(),
        )
    })?;
    if !deleted {
        return Err(session_not_found(&id));
    }
    if let Err(err) = state.tasks.delete_for_session(&id).await {
        tracing::warn!(session_id = %id, error = %err, "task cascade delete failed");
    }
    if let Err(err) = state.artifacts.delete_for_session(&id).await {
        tracing::warn!(session_id = %id, error = %err, "artifact cascade delete failed");
    }
    if let Err(err) = state.execution_log.delete_for_session(&id).await {
        tracing::warn!(session_id = %id, error = %err, "log cascade delete failed");
    }
    if let Err(err) = state.threads.delete_for_session(&id).await {
        tracing::warn!(session_id = %id, error = %err, "thread cascade delete failed");
    }
    if let Err(err) = state.connections.delete_for_session(&id).await {
        tracing::warn!(session_id = %id, error = %err, "connection cascade delete failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ChatInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    if session.status == SessionStatus::Executing {
        return Err(api_error(
            StatusCode::CONFLICT,
            "session_executing",
            "session is executing; pause it before planning",
        ));
    }
    let stream = state
        .planner
        .chat(&id, input.message, CancellationToken::new())
        .map(|event| {
            Ok(Event::default().data(serde_json::to_string(&event).unwrap_or_default()))
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state
        .orchestrator
        .execute(&id, CancellationToken::new())
        .await
        .map_err(|err| match err {
            ExecuteError::SessionNotFound(_) => session_not_found(&id),
            ExecuteError::InvalidStatus { status, .. } => api_error(
                StatusCode::CONFLICT,
                "invalid_session_status",
                format!("session {id} cannot execute from status {status}"),
            ),
            ExecuteError::NoTasks(_) => api_error(
                StatusCode::BAD_REQUEST,
                "no_tasks_to_execute",
                format!("session {id} has no tasks to execute"),
            ),
        })?;
    let stream = stream.map(|event| {
        Ok(Event::default().data(serde_json::to_string(&event).unwrap_or_default()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn execution_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<HeartbeatInput>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .connections
        .heartbeat(&id, &input.connection_id)
        .await
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "heartbeat_failed",
                e.to_string(),
            )
        })?;
    Ok(Json(json!({ "accepted": accepted })))
}

/// Claims a session whose previous watcher is gone. Registers a fresh
/// connection, and force-pauses a session stuck in `executing` so the stale
/// loop is guaranteed to observe the supersession at its next checkpoint.
async fn claim_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    let connection_id = Uuid::new_v4().to_string();
    state
        .connections
        .register(&id, &connection_id)
        .await
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "claim_failed",
                e.to_string(),
            )
        })?;
    if session.status == SessionStatus::Executing {
        if let Err(err) = state.sessions.set_status(&id, SessionStatus::Paused).await {
            tracing::warn!(session_id = %id, error = %err, "claim force-pause failed");
        }
    }
    Ok(Json(json!({ "connectionId": connection_id })))
}

async fn pause_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state.connections.request_pause(&id).await.map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pause_failed",
            e.to_string(),
        )
    })?;
    Ok(Json(json!({ "accepted": accepted })))
}

async fn execution_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExecutionLogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    let limit = query.limit.unwrap_or(200);
    let offset = query.offset.unwrap_or(0);
    let entries = state.execution_log.list(&id, limit, offset).await;
    let total = state.execution_log.count(&id).await;
    Ok(Json(json!({ "entries": entries, "total": total })))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| session_not_found(&id))?;
    Ok(Json(json!({
        "artifacts": state.artifacts.list_for_session(&id).await
    })))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let artifact = state.artifacts.get(&id).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "artifact_not_found",
            format!("artifact {id} not found"),
        )
    })?;
    Ok(Json(artifact))
}

async fn delete_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.artifacts.delete(&id).await.map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "artifact_delete_failed",
            e.to_string(),
        )
    })?;
    if !deleted {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "artifact_not_found",
            format!("artifact {id} not found"),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Process-wide execution event firehose, optionally filtered to a session.
async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let filter_session = filter.session_id.clone();
        async move {
            match msg {
                Ok(session_event) => {
                    if let Some(wanted) = filter_session.as_deref() {
                        if session_event.session_id != wanted {
                            return None;
                        }
                    }
                    let payload = json!({
                        "sessionID": session_event.session_id,
                        "event": session_event.event,
                    });
                    Some(Ok(Event::default().data(payload.to_string())))
                }
                Err(_) => None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use cadence_providers::{ChatMessage, ChunkStream, Provider, ProviderRegistry, StreamChunk};
    use cadence_types::{ExecutionEvent, ProviderInfo, TaskDraft, TaskStatus, ToolSchema};
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    struct QueueProvider {
        replies: Mutex<VecDeque<String>>,
    }

    impl QueueProvider {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            })
        }

        fn pop(&self) -> String {
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| "done".to_string())
        }
    }

    #[async_trait::async_trait]
    impl Provider for QueueProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "queued".to_string(),
                name: "Queued".to_string(),
                models: Vec::new(),
            }
        }

        async fn complete(&self, _prompt: &str, _model: Option<&str>) -> anyhow::Result<String> {
            Ok(self.pop())
        }

        async fn stream(
            &self,
            _messages: Vec<ChatMessage>,
            _model: Option<&str>,
            _tools: Option<Vec<ToolSchema>>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChunkStream> {
            let text = self.pop();
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(StreamChunk::TextDelta(text)),
                Ok(StreamChunk::Done {
                    finish_reason: "stop".to_string(),
                    usage: None,
                }),
            ])))
        }
    }

    async fn test_state(replies: Vec<&str>) -> AppState {
        let config = ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            data_dir: std::env::temp_dir().join(format!("cadence-http-{}", Uuid::new_v4())),
            logs_dir: std::env::temp_dir().join(format!("cadence-http-logs-{}", Uuid::new_v4())),
            log_retention_days: 1,
            heartbeat_timeout: Duration::from_secs(15),
            providers: Default::default(),
        };
        let providers = ProviderRegistry::with_providers(vec![QueueProvider::new(replies)]);
        AppState::build_with_providers(&config, providers)
            .await
            .expect("state")
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn post_req(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_version() {
        let state = test_state(vec![]).await;
        let app = app_router(state);
        let resp = app.oneshot(get_req("/health")).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload.get("healthy").and_then(|v| v.as_bool()), Some(true));
        assert!(payload.get("version").and_then(|v| v.as_str()).is_some());
    }

    #[tokio::test]
    async fn session_lifecycle_created_fetched_deleted() {
        let state = test_state(vec![]).await;
        let app = app_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_req("/sessions", json!({"title": "Trip planning"})))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        let id = created
            .get("id")
            .and_then(|v| v.as_str())
            .expect("id")
            .to_string();
        assert_eq!(
            created.get("title").and_then(|v| v.as_str()),
            Some("Trip planning")
        );
        assert_eq!(
            created.get("status").and_then(|v| v.as_str()),
            Some("planning")
        );

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/sessions/{id}")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/sessions/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(get_req(&format!("/sessions/{id}")))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("code").and_then(|v| v.as_str()),
            Some("session_not_found")
        );
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_to_its_tasks() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        state
            .tasks
            .create_many(
                &session.id,
                vec![TaskDraft {
                    title: "orphan-to-be".to_string(),
                    description: None,
                }],
            )
            .await
            .expect("tasks");
        let app = app_router(state.clone());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/sessions/{}", session.id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.tasks.list_for_session(&session.id).await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_reports_supersession() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        state
            .connections
            .register(&session.id, "conn-a")
            .await
            .expect("register");
        state
            .connections
            .register(&session.id, "conn-b")
            .await
            .expect("register");
        let app = app_router(state);

        let resp = app
            .clone()
            .oneshot(post_req(
                &format!("/sessions/{}/execution-heartbeat", session.id),
                json!({"connectionId": "conn-a"}),
            ))
            .await
            .expect("response");
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("accepted").and_then(|v| v.as_bool()),
            Some(false)
        );

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/execution-heartbeat", session.id),
                json!({"connectionId": "conn-b"}),
            ))
            .await
            .expect("response");
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("accepted").and_then(|v| v.as_bool()),
            Some(true)
        );
    }

    #[tokio::test]
    async fn claiming_an_executing_session_force_pauses_it() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        state
            .sessions
            .set_status(&session.id, SessionStatus::Executing)
            .await
            .expect("status");
        state
            .connections
            .register(&session.id, "stale-conn")
            .await
            .expect("register");
        let app = app_router(state.clone());

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/claim-execution", session.id),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        let new_conn = payload
            .get("connectionId")
            .and_then(|v| v.as_str())
            .expect("connection id");

        let updated = state.sessions.get(&session.id).await.expect("session");
        assert_eq!(updated.status, SessionStatus::Paused);
        let record = state.connections.get(&session.id).await.expect("record");
        assert_eq!(record.connection_id, new_conn);
        assert_ne!(record.connection_id, "stale-conn");
    }

    #[tokio::test]
    async fn pause_request_without_a_connection_is_rejected() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        let app = app_router(state);

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/pause-execution", session.id),
                json!({}),
            ))
            .await
            .expect("response");
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("accepted").and_then(|v| v.as_bool()),
            Some(false)
        );
    }

    #[tokio::test]
    async fn execution_log_endpoint_pages_entries() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        for i in 0..5 {
            state
                .execution_log
                .append(
                    &session.id,
                    ExecutionEvent::TaskSelected {
                        task_id: format!("t{i}"),
                    },
                )
                .await
                .expect("append");
        }
        let app = app_router(state);

        let resp = app
            .oneshot(get_req(&format!(
                "/sessions/{}/execution-logs?limit=2&offset=1",
                session.id
            )))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload.get("total").and_then(|v| v.as_u64()), Some(5));
        let entries = payload
            .get("entries")
            .and_then(|v| v.as_array())
            .expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0]
                .get("event")
                .and_then(|e| e.get("taskId"))
                .and_then(|v| v.as_str()),
            Some("t1")
        );
    }

    #[tokio::test]
    async fn execute_rejects_a_completed_session_with_conflict() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        state
            .sessions
            .set_status(&session.id, SessionStatus::Completed)
            .await
            .expect("status");
        let app = app_router(state);

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/execute", session.id),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("code").and_then(|v| v.as_str()),
            Some("invalid_session_status")
        );
    }

    #[tokio::test]
    async fn execute_rejects_a_session_without_tasks() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        let app = app_router(state);

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/execute", session.id),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let payload = json_body(resp).await;
        assert_eq!(
            payload.get("code").and_then(|v| v.as_str()),
            Some("no_tasks_to_execute")
        );
    }

    #[tokio::test]
    async fn execute_streams_connection_through_done() {
        // One task; the provider replies with the task result, then declines
        // the artifact.
        let state = test_state(vec!["the result", r#"{"create": false}"#]).await;
        let session = state.sessions.create(None).await.expect("session");
        state
            .tasks
            .create_many(
                &session.id,
                vec![TaskDraft {
                    title: "only task".to_string(),
                    description: None,
                }],
            )
            .await
            .expect("tasks");
        let app = app_router(state.clone());

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/execute", session.id),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("\"connection\""));
        assert!(text.contains("\"task_selected\""));
        assert!(text.contains("\"task_completed\""));
        assert!(text.contains("\"done\""));

        let updated = state.sessions.get(&session.id).await.expect("session");
        assert_eq!(updated.status, SessionStatus::Completed);
        let tasks = state.tasks.list_for_session(&session.id).await;
        assert_eq!(tasks[0].status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn chat_streams_planning_events_and_creates_tasks() {
        let state = test_state(vec![
            "Here is a plan.",
            r#"[{"title": "Book flights"}, {"title": "Reserve hotel"}]"#,
        ])
        .await;
        let session = state.sessions.create(None).await.expect("session");
        let app = app_router(state.clone());

        let resp = app
            .oneshot(post_req(
                &format!("/sessions/{}/chat", session.id),
                json!({"message": "Plan a trip to Kyoto"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("\"tasks_updated\""));
        assert!(text.contains("\"done\""));

        let tasks = state.tasks.list_for_session(&session.id).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Book flights");
        // First prompt titles the session.
        let updated = state.sessions.get(&session.id).await.expect("session");
        assert_eq!(updated.title, "Plan a trip to Kyoto");
    }

    #[tokio::test]
    async fn artifact_routes_list_fetch_and_delete() {
        let state = test_state(vec![]).await;
        let session = state.sessions.create(None).await.expect("session");
        let artifact = state
            .artifacts
            .create(
                &session.id,
                Some("task-1"),
                "Findings",
                cadence_types::ArtifactType::Document,
                "body text".to_string(),
            )
            .await
            .expect("artifact");
        let app = app_router(state);

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/sessions/{}/artifacts", session.id)))
            .await
            .expect("response");
        let payload = json_body(resp).await;
        let listed = payload
            .get("artifacts")
            .and_then(|v| v.as_array())
            .expect("artifacts");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].get("content").is_none());

        let resp = app
            .clone()
            .oneshot(get_req(&format!("/artifacts/{}", artifact.id)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = json_body(resp).await;
        assert_eq!(
            fetched.get("content").and_then(|v| v.as_str()),
            Some("body text")
        );

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/artifacts/{}", artifact.id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(get_req(&format!("/artifacts/{}", artifact.id)))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
