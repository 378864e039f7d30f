use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use daemon::{
    api,
    channel::{ChannelNotifier, LogChannel, OutboundChannel, WebhookChannel},
    clock::{Clock, TokioClock},
    config::{Config, DeliveryPolicy, LogFormat},
    delivery::{DeliveryConfig, DeliveryPipeline, Escalation, FallbackPath, HttpCoreTransport},
    invoke::{AgentCommand, CliInvoker},
    remediation::{Notifier, RemediationConfig, RemediationOrchestrator},
    shutdown,
    supervisor::{CommandSpawner, DiagnosticsSource, ProcessSupervisor, SupervisorConfig},
    AppState,
};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "daemon=debug,tower_http=info".into());
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);
    info!(
        port = config.port,
        core_base_url = %config.core_base_url,
        policy = ?config.delivery_policy,
        "daemon starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let client = reqwest::Client::builder().build()?;

    // Core supervisor
    let spawner = CommandSpawner::new(
        config.core_binary.clone(),
        config.core_args.clone(),
        config.core_port,
    )
    .with_working_dir(config.project_root.clone())
    .with_env("PROJECT_ROOT", config.project_root.to_string_lossy());
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig {
            role: "core".to_string(),
            restart_delay: config.restart_delay,
            crash_loop_window: config.crash_loop_window,
            crash_loop_threshold: config.crash_loop_threshold,
            diagnostic_capacity: config.diagnostic_capacity,
        },
        Arc::new(spawner),
        Arc::clone(&clock),
    );

    // Delivery pipeline
    let transport = HttpCoreTransport::new(
        client.clone(),
        &config.core_base_url,
        config.core_request_timeout(),
        config.health_timeout,
    );
    let escalation = match config.delivery_policy {
        DeliveryPolicy::Queue => Escalation::QueueAndDrain,
        DeliveryPolicy::Fallback => Escalation::ImmediateFallback(FallbackPath::new(
            Arc::new(CliInvoker::new(AgentCommand {
                binary: config.fallback_binary.clone(),
                args: config.fallback_args.clone(),
                working_dir: config.project_root.clone(),
            })),
            Arc::clone(&supervisor) as Arc<dyn DiagnosticsSource>,
            config.fallback_timeout,
        )),
    };
    let pipeline = DeliveryPipeline::new(
        Arc::new(transport),
        Arc::clone(&clock),
        DeliveryConfig {
            retry_delay: config.retry_delay,
            drain_interval: config.drain_interval,
            max_retry_window: config.max_retry_window,
        },
        escalation,
    );

    // Outbound channel and remediation
    let channel: Arc<dyn OutboundChannel> = match &config.channel_webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(client.clone(), url.clone())),
        None => {
            warn!("CHANNEL_WEBHOOK_URL not set; outbound messages are only logged");
            Arc::new(LogChannel)
        }
    };
    let notifier: Arc<dyn Notifier> = Arc::new(ChannelNotifier::new(
        Arc::clone(&channel),
        config
            .admin_chat_id
            .clone()
            .unwrap_or_else(|| "admin".to_string()),
    ));
    let remediation = RemediationOrchestrator::new(
        Arc::new(CliInvoker::new(AgentCommand {
            binary: config.remediation_binary.clone(),
            args: config.remediation_args.clone(),
            working_dir: config.project_root.clone(),
        })),
        notifier,
        Arc::clone(&clock),
        RemediationConfig {
            max_attempts: config.remediation_max_attempts,
            cooldown: config.remediation_cooldown,
            timeout: config.remediation_timeout,
            ..RemediationConfig::default()
        },
    );

    let shutdown = CancellationToken::new();
    if config.auto_remediate {
        tokio::spawn(Arc::clone(&remediation).watch_crash_loops(
            Arc::clone(&supervisor) as Arc<dyn DiagnosticsSource>,
            supervisor.subscribe(),
            shutdown.clone(),
        ));
    }

    supervisor.start();

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        pipeline: Arc::clone(&pipeline),
        remediation,
        channel,
    });

    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::on_signal(
            ctrl_c,
            Arc::clone(&pipeline),
            shutdown.clone(),
        ))
        .await?;

    info!("stopping core");
    supervisor.stop();
    Ok(())
}
