use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{EventBus, Orchestrator, OrchestratorConfig, Planner, TaskWorkflow};
use cadence_providers::{ProviderConfig, ProviderRegistry, ProvidersConfig};
use cadence_store::{
    ArtifactStore, ConnectionStore, ExecutionLogStore, SessionStore, TaskStore, ThreadStore,
};
use cadence_tools::ToolRegistry;

pub mod http;

pub use http::run_http_server;

/// Env-driven server configuration, `CADENCE_*` variables with sensible
/// defaults throughout.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub log_retention_days: u64,
    pub heartbeat_timeout: Duration,
    pub providers: ProvidersConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("CADENCE_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let port = std::env::var("CADENCE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4400);
        let data_dir = std::env::var("CADENCE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cadence-data"));
        let logs_dir = std::env::var("CADENCE_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs"));
        let log_retention_days = std::env::var("CADENCE_LOG_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7);
        let heartbeat_timeout = std::env::var("CADENCE_HEARTBEAT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));
        Self {
            host,
            port,
            data_dir,
            logs_dir,
            log_retention_days,
            heartbeat_timeout,
            providers: providers_from_env(),
        }
    }
}

fn providers_from_env() -> ProvidersConfig {
    let mut providers = HashMap::new();
    if let Some(key) = env_value("CADENCE_OPENAI_API_KEY").or_else(|| env_value("OPENAI_API_KEY")) {
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key: Some(key),
                url: env_value("CADENCE_OPENAI_URL"),
                default_model: env_value("CADENCE_OPENAI_MODEL"),
            },
        );
    }
    if let Some(key) =
        env_value("CADENCE_OPENROUTER_API_KEY").or_else(|| env_value("OPENROUTER_API_KEY"))
    {
        providers.insert(
            "openrouter".to_string(),
            ProviderConfig {
                api_key: Some(key),
                url: None,
                default_model: env_value("CADENCE_OPENROUTER_MODEL"),
            },
        );
    }
    if let Some(url) = env_value("CADENCE_OLLAMA_URL") {
        providers.insert(
            "ollama".to_string(),
            ProviderConfig {
                api_key: None,
                url: Some(url),
                default_model: env_value("CADENCE_OLLAMA_MODEL"),
            },
        );
    }
    ProvidersConfig {
        providers,
        default_provider: env_value("CADENCE_DEFAULT_PROVIDER"),
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub connections: Arc<ConnectionStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub execution_log: Arc<ExecutionLogStore>,
    pub threads: Arc<ThreadStore>,
    pub providers: ProviderRegistry,
    pub tools: ToolRegistry,
    pub event_bus: EventBus,
    pub orchestrator: Orchestrator,
    pub planner: Planner,
}

impl AppState {
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        Self::build_with_providers(config, ProviderRegistry::new(config.providers.clone())).await
    }

    pub async fn build_with_providers(
        config: &ServerConfig,
        providers: ProviderRegistry,
    ) -> anyhow::Result<Self> {
        let base = &config.data_dir;
        let sessions = Arc::new(SessionStore::new(base).await?);
        let tasks = Arc::new(TaskStore::new(base).await?);
        let connections = Arc::new(ConnectionStore::new(base).await?);
        let artifacts = Arc::new(ArtifactStore::new(base).await?);
        let execution_log = Arc::new(ExecutionLogStore::new(base).await?);
        let threads = Arc::new(ThreadStore::new(base).await?);
        let tools = ToolRegistry::new();
        let event_bus = EventBus::new();

        let workflow = TaskWorkflow::new(
            providers.clone(),
            tools.clone(),
            tasks.clone(),
            threads.clone(),
            artifacts.clone(),
        );
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                heartbeat_timeout: config.heartbeat_timeout,
            },
            workflow,
            sessions.clone(),
            tasks.clone(),
            connections.clone(),
            execution_log.clone(),
            event_bus.clone(),
        );
        let planner = Planner::new(
            providers.clone(),
            sessions.clone(),
            tasks.clone(),
            threads.clone(),
        );

        Ok(Self {
            sessions,
            tasks,
            connections,
            artifacts,
            execution_log,
            threads,
            providers,
            tools,
            event_bus,
            orchestrator,
            planner,
        })
    }
}
