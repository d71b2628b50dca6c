use cadence_server::{run_http_server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let (_log_guard, log_info) =
        cadence_observability::init_process_logging(&config.logs_dir, config.log_retention_days)?;
    tracing::info!(
        logs_dir = %log_info.logs_dir,
        data_dir = %config.data_dir.display(),
        "cadence server starting"
    );
    run_http_server(config).await
}
