//! Core worker: the process the daemon supervises.
//!
//! Serves `GET /health` and `POST /message`. Each message is answered by
//! running the configured agent CLI once in the project root.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared_types::{CoreReply, HealthResponse, IncomingMessage, MessageEnvelope};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub agent_binary: String,
    pub agent_args: Vec<String>,
    pub project_root: PathBuf,
    pub agent_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = &vars;
        Ok(Self {
            port: env_parse(vars, "PORT", 8090)?,
            agent_binary: env_str(vars, "AGENT_BINARY", "agent"),
            agent_args: env_csv(vars, "AGENT_ARGS", &["--print"]),
            project_root: PathBuf::from(env_str(vars, "PROJECT_ROOT", ".")),
            agent_timeout: Duration::from_secs(env_parse(vars, "AGENT_TIMEOUT_SECS", 120)?),
        })
    }
}

fn env_str(vars: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    vars(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match vars(key) {
        Some(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(default),
    }
}

fn env_csv(vars: &impl Fn(&str) -> Option<String>, key: &str, default: &[&str]) -> Vec<String> {
    match vars(key) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent exec failed: {0}")]
    Exec(#[from] std::io::Error),
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("agent produced no output")]
    Empty,
}

/// Runs the agent CLI with the prompt as its last argument.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    binary: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(binary: String, args: Vec<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            args,
            working_dir,
            timeout,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.agent_binary.clone(),
            config.agent_args.clone(),
            config.project_root.clone(),
            config.agent_timeout,
        )
    }

    /// Trimmed stdout of a successful, non-empty run.
    pub async fn run(&self, prompt: &str) -> Result<String, AgentError> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(&self.args)
                .arg(prompt)
                .current_dir(&self.working_dir)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| AgentError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Failed {
                code: output.status.code(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(AgentError::Empty);
        }
        Ok(stdout)
    }
}

pub fn build_prompt(message: &IncomingMessage) -> String {
    if message.attachments.is_empty() {
        return message.text.clone();
    }
    format!(
        "{}\n\nAttached files:\n{}",
        message.text,
        message
            .attachments
            .iter()
            .map(|path| format!("- {path}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

pub fn router() -> Router<Arc<AgentRunner>> {
    Router::new()
        .route("/health", get(health))
        .route("/message", post(handle_message))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse::ok("core"))
}

/// POST /message
pub async fn handle_message(
    State(runner): State<Arc<AgentRunner>>,
    Json(envelope): Json<MessageEnvelope>,
) -> impl IntoResponse {
    let message = envelope.message;
    info!(message_id = %message.id, chat_id = %message.chat_id, "message received");

    match runner.run(&build_prompt(&message)).await {
        Ok(text) => Json(CoreReply::text(text)).into_response(),
        Err(e @ AgentError::Empty) | Err(e @ AgentError::Failed { .. }) => {
            warn!(message_id = %message.id, "agent run failed: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => {
            error!(message_id = %message.id, "agent run failed: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> AgentRunner {
        // The prompt lands in $0 of the script.
        AgentRunner::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            PathBuf::from("."),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_stdout_becomes_reply() {
        let runner = sh("echo \"  answer to: $0 \"", Duration::from_secs(5));
        assert_eq!(runner.run("ping").await.unwrap(), "answer to: ping");
    }

    #[tokio::test]
    async fn test_failed_and_empty_runs() {
        let runner = sh("echo oops >&2; exit 4", Duration::from_secs(5));
        match runner.run("ping").await {
            Err(AgentError::Failed { code, stderr }) => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected {other:?}"),
        }

        let runner = sh("true", Duration::from_secs(5));
        assert!(matches!(runner.run("ping").await, Err(AgentError::Empty)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = sh("exec sleep 30", Duration::from_millis(200));
        assert!(matches!(
            runner.run("ping").await,
            Err(AgentError::Timeout(_))
        ));
    }

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<WorkerConfig> {
        let vars: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let defaults = config(&[]).unwrap();
        assert_eq!(defaults.port, 8090);
        assert_eq!(defaults.agent_binary, "agent");
        assert_eq!(defaults.agent_args, vec!["--print"]);
        assert_eq!(defaults.agent_timeout, Duration::from_secs(120));

        let custom = config(&[
            ("PORT", "9191"),
            ("AGENT_ARGS", "-p, --json ,"),
            ("AGENT_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(custom.port, 9191);
        assert_eq!(custom.agent_args, vec!["-p", "--json"]);
        assert_eq!(custom.agent_timeout, Duration::from_secs(30));

        let err = config(&[("PORT", "high")]).unwrap_err();
        assert!(err.to_string().contains("PORT=high"));
    }

    #[test]
    fn test_prompt_lists_attachments() {
        let mut message = IncomingMessage::new("m1", "c1", "summarize this");
        assert_eq!(build_prompt(&message), "summarize this");

        message.attachments = vec!["uploads/a.pdf".to_string()];
        assert_eq!(
            build_prompt(&message),
            "summarize this\n\nAttached files:\n- uploads/a.pdf"
        );
    }
}
