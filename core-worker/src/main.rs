use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use core_worker::{router, AgentRunner, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "core_worker=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = WorkerConfig::from_env()?;
    info!(
        port = config.port,
        agent = %config.agent_binary,
        project_root = %config.project_root.display(),
        "core worker starting"
    );

    let runner = Arc::new(AgentRunner::from_config(&config));
    let app = router()
        .layer(TraceLayer::new_for_http())
        .with_state(runner);

    let addr = format!("127.0.0.1:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
