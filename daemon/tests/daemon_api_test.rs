//! Daemon HTTP API Integration Tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use shared_types::{CoreReply, IncomingMessage, MessageEnvelope, SendRequest};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use daemon::api;
use daemon::channel::{ChannelError, OutboundChannel};
use daemon::clock::{Clock, TokioClock};
use daemon::delivery::{CoreTransport, DeliveryConfig, DeliveryPipeline, Escalation, TransportError};
use daemon::invoke::{AgentInvoker, InvocationOutput, InvokeError};
use daemon::remediation::{Notifier, RemediationConfig, RemediationOrchestrator};
use daemon::shutdown;
use daemon::supervisor::{
    CommandSpawner, ProcessSupervisor, SupervisorConfig, SupervisorEvent,
};
use daemon::AppState;

struct StaticCore {
    up: bool,
}

#[async_trait]
impl CoreTransport for StaticCore {
    async fn deliver(&self, message: &IncomingMessage) -> Result<CoreReply, TransportError> {
        if self.up {
            Ok(CoreReply::text(format!("core: {}", message.text)))
        } else {
            Err(TransportError::Request("connection refused".to_string()))
        }
    }

    async fn health(&self) -> bool {
        self.up
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<SendRequest>>,
    fail: bool,
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    async fn send(&self, request: &SendRequest) -> Result<(), ChannelError> {
        if self.fail {
            return Err(ChannelError::Status(502));
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _text: &str) {}
}

struct EchoInvoker {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(
        &self,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<InvocationOutput, InvokeError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(InvocationOutput {
            exit_code: Some(0),
            stdout: "fixed it".to_string(),
            ..Default::default()
        })
    }
}

struct TestApp {
    router: axum::Router,
    supervisor: Arc<ProcessSupervisor>,
    pipeline: Arc<DeliveryPipeline>,
    channel: Arc<RecordingChannel>,
    invoker: Arc<EchoInvoker>,
}

fn setup_test_app(core_up: bool, channel_fails: bool, core_command: &str) -> TestApp {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig {
            restart_delay: Duration::from_secs(600),
            ..SupervisorConfig::default()
        },
        Arc::new(CommandSpawner::new(
            "sh".to_string(),
            vec!["-c".to_string(), core_command.to_string()],
            0,
        )),
        Arc::clone(&clock),
    );
    let pipeline = DeliveryPipeline::new(
        Arc::new(StaticCore { up: core_up }),
        Arc::clone(&clock),
        DeliveryConfig::default(),
        Escalation::QueueAndDrain,
    );
    let invoker = Arc::new(EchoInvoker {
        prompts: Mutex::new(Vec::new()),
    });
    let remediation = RemediationOrchestrator::new(
        Arc::clone(&invoker) as Arc<dyn AgentInvoker>,
        Arc::new(NoopNotifier),
        Arc::clone(&clock),
        RemediationConfig::default(),
    );
    let channel = Arc::new(RecordingChannel {
        fail: channel_fails,
        ..Default::default()
    });

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        pipeline: Arc::clone(&pipeline),
        remediation,
        channel: Arc::clone(&channel) as Arc<dyn OutboundChannel>,
    });

    TestApp {
        router: api::router().with_state(state),
        supervisor,
        pipeline,
        channel,
        invoker,
    }
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = setup_test_app(true, false, "exit 0");

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = json_response(&app.router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "daemon");
}

#[tokio::test]
async fn test_message_is_answered_by_core() {
    let app = setup_test_app(true, false, "exit 0");
    let envelope = MessageEnvelope {
        message: IncomingMessage::new("m1", "chat-1", "ping"),
    };

    let (status, body) = json_response(&app.router, post_json("/message", &envelope)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "core: ping");
}

#[tokio::test(start_paused = true)]
async fn test_message_expires_with_gateway_timeout() {
    let app = setup_test_app(false, false, "exit 0");
    let envelope = MessageEnvelope {
        message: IncomingMessage::new("m1", "chat-1", "hello"),
    };

    let (status, body) = json_response(&app.router, post_json("/message", &envelope)).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("did not recover"));
}

#[tokio::test]
async fn test_shutdown_signal_answers_parked_messages_before_server_drains() {
    let app = setup_test_app(false, false, "exit 0");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger, signal) = tokio::sync::oneshot::channel::<()>();
    let background = CancellationToken::new();

    let serve = axum::serve(listener, app.router.clone()).with_graceful_shutdown(
        shutdown::on_signal(
            async {
                signal.await.ok();
            },
            Arc::clone(&app.pipeline),
            background.clone(),
        ),
    );
    let server = tokio::spawn(async move { serve.await });

    let envelope = MessageEnvelope {
        message: IncomingMessage::new("m1", "chat-1", "hello"),
    };
    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://{addr}/message"))
            .json(&envelope)
            .send()
            .await
    });

    // Primary attempt and retry fail, then the message parks in the queue.
    tokio::time::timeout(Duration::from_secs(10), async {
        while app.pipeline.queue_depth() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("message never queued");

    trigger.send(()).unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), request)
        .await
        .expect("parked request not answered")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not drain")
        .unwrap()
        .unwrap();
    assert!(background.is_cancelled());
    assert_eq!(app.pipeline.queue_depth(), 0);
}

#[tokio::test]
async fn test_status_reports_core_and_queue() {
    let app = setup_test_app(false, false, "exit 0");

    let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
    let (status, body) = json_response(&app.router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["core"]["role"], "core");
    assert_eq!(body["core"]["up"], false);
    assert_eq!(body["core"]["desired"], "running");
    assert_eq!(body["coreHealthy"], false);
    assert_eq!(body["queueDepth"], 0);
    assert_eq!(body["policy"], "queue");
}

#[tokio::test]
async fn test_send_forwards_to_channel() {
    let app = setup_test_app(true, false, "exit 0");
    let request = SendRequest {
        chat_id: "chat-7".to_string(),
        text: "scheduled reminder".to_string(),
        files: Vec::new(),
    };

    let (status, body) = json_response(&app.router, post_json("/send", &request)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(*app.channel.sent.lock().unwrap(), vec![request]);
}

#[tokio::test]
async fn test_send_channel_failure_is_bad_gateway() {
    let app = setup_test_app(true, true, "exit 0");
    let request = SendRequest {
        chat_id: "chat-7".to_string(),
        text: "hi".to_string(),
        files: Vec::new(),
    };

    let (status, _) = json_response(&app.router, post_json("/send", &request)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_remediate_without_captured_error_conflicts() {
    let app = setup_test_app(true, false, "exit 0");

    let (status, _) = json_response(&app.router, post_empty("/admin/remediate")).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(app.invoker.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_crash_output_drives_remediation() {
    let app = setup_test_app(
        true,
        false,
        "echo 'panicked at src/handler.rs:12:5' >&2; exit 101",
    );
    let mut events = app.supervisor.subscribe();

    app.supervisor.start();
    let exited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(SupervisorEvent::Exited { code, .. }) = events.recv().await {
                return code;
            }
        }
    })
    .await
    .expect("core never exited");
    assert_eq!(exited, Some(101));

    let (status, body) = json_response(&app.router, post_empty("/admin/remediate")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["attemptsInWindow"], 1);
    let prompts = app.invoker.prompts.lock().unwrap();
    assert!(prompts[0].contains("- src/handler.rs"));

    app.supervisor.stop();
}

#[tokio::test]
async fn test_admin_stop_and_start() {
    let app = setup_test_app(true, false, "exec sleep 30");

    let (status, body) = json_response(&app.router, post_empty("/admin/core/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["desired"], "stopped");
    assert_eq!(body["up"], false);

    let (status, body) = json_response(&app.router, post_empty("/admin/core/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["desired"], "running");
    assert_eq!(body["up"], true);

    app.supervisor.stop();
}
