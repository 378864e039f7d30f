use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    Queue,
    Fallback,
}

impl DeliveryPolicy {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "queue" => Ok(Self::Queue),
            "fallback" => Ok(Self::Fallback),
            other => Err(anyhow::anyhow!(
                "Invalid DELIVERY_POLICY '{other}'. Expected 'queue' or 'fallback'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!(
                "Invalid LOG_FORMAT '{other}'. Expected 'text' or 'json'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the daemon listens on
    pub port: u16,
    /// Path to the core worker binary
    pub core_binary: String,
    pub core_args: Vec<String>,
    /// Port handed to the core worker through `PORT`
    pub core_port: u16,
    /// Where the daemon reaches the core worker
    pub core_base_url: String,
    pub delivery_policy: DeliveryPolicy,
    pub retry_delay: Duration,
    pub drain_interval: Duration,
    pub max_retry_window: Duration,
    /// Expected worst-case time for the core to answer one message
    pub processing_budget: Duration,
    /// Added to the processing budget for the RPC deadline
    pub request_margin: Duration,
    pub health_timeout: Duration,
    pub restart_delay: Duration,
    pub crash_loop_window: Duration,
    pub crash_loop_threshold: u32,
    pub diagnostic_capacity: usize,
    pub fallback_binary: String,
    pub fallback_args: Vec<String>,
    pub fallback_timeout: Duration,
    pub remediation_binary: String,
    pub remediation_args: Vec<String>,
    pub remediation_max_attempts: u32,
    pub remediation_cooldown: Duration,
    pub remediation_timeout: Duration,
    /// Run remediation automatically when the core enters a crash loop
    pub auto_remediate: bool,
    /// Working directory for the core and every agent invocation
    pub project_root: PathBuf,
    /// Channel adapter endpoint for outbound messages. Logged when unset.
    pub channel_webhook_url: Option<String>,
    /// Conversation that receives remediation notices
    pub admin_chat_id: Option<String>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = &vars;
        let core_port = env_parse(vars, "CORE_PORT", 8090)?;

        Ok(Self {
            port: env_parse(vars, "DAEMON_PORT", 9090)?,
            core_binary: vars("CORE_BINARY").unwrap_or_else(|| {
                // The daemon may be launched from any directory, so default to
                // an absolute path into the workspace target dir.
                let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                workspace_root
                    .join("target/debug/core-worker")
                    .to_string_lossy()
                    .to_string()
            }),
            core_args: env_csv(vars, "CORE_ARGS", &[]),
            core_port,
            core_base_url: vars("CORE_BASE_URL")
                .unwrap_or_else(|| format!("http://127.0.0.1:{core_port}")),
            delivery_policy: DeliveryPolicy::from_env(&env_str(vars, "DELIVERY_POLICY", "queue"))?,
            retry_delay: Duration::from_millis(env_parse(vars, "DELIVERY_RETRY_DELAY_MS", 3000)?),
            drain_interval: Duration::from_millis(env_parse(
                vars,
                "DELIVERY_DRAIN_INTERVAL_MS",
                2000,
            )?),
            max_retry_window: Duration::from_secs(env_parse(
                vars,
                "DELIVERY_MAX_RETRY_WINDOW_SECS",
                60,
            )?),
            processing_budget: Duration::from_secs(env_parse(
                vars,
                "CORE_PROCESSING_BUDGET_SECS",
                120,
            )?),
            request_margin: Duration::from_secs(env_parse(vars, "CORE_REQUEST_MARGIN_SECS", 10)?),
            health_timeout: Duration::from_millis(env_parse(vars, "HEALTH_TIMEOUT_MS", 2000)?),
            restart_delay: Duration::from_millis(env_parse(vars, "RESTART_DELAY_MS", 2000)?),
            crash_loop_window: Duration::from_secs(env_parse(vars, "CRASH_LOOP_WINDOW_SECS", 10)?),
            crash_loop_threshold: env_parse(vars, "CRASH_LOOP_THRESHOLD", 5)?,
            diagnostic_capacity: env_parse(vars, "DIAGNOSTIC_CAPACITY", 2000)?,
            fallback_binary: env_str(vars, "FALLBACK_BINARY", "agent"),
            fallback_args: env_csv(vars, "FALLBACK_ARGS", &["--print"]),
            fallback_timeout: Duration::from_secs(env_parse(vars, "FALLBACK_TIMEOUT_SECS", 120)?),
            remediation_binary: env_str(vars, "REMEDIATION_BINARY", "agent"),
            remediation_args: env_csv(vars, "REMEDIATION_ARGS", &["--print"]),
            remediation_max_attempts: env_parse(vars, "REMEDIATION_MAX_ATTEMPTS", 3)?,
            remediation_cooldown: Duration::from_secs(env_parse(
                vars,
                "REMEDIATION_COOLDOWN_SECS",
                120,
            )?),
            remediation_timeout: Duration::from_secs(env_parse(
                vars,
                "REMEDIATION_TIMEOUT_SECS",
                180,
            )?),
            auto_remediate: env_parse(vars, "AUTO_REMEDIATE", false)?,
            project_root: PathBuf::from(env_str(vars, "PROJECT_ROOT", ".")),
            channel_webhook_url: vars("CHANNEL_WEBHOOK_URL").filter(|v| !v.trim().is_empty()),
            admin_chat_id: vars("ADMIN_CHAT_ID").filter(|v| !v.trim().is_empty()),
            log_format: LogFormat::from_env(&env_str(vars, "LOG_FORMAT", "text"))?,
        })
    }

    /// Deadline for one `POST /message` to the core.
    pub fn core_request_timeout(&self) -> Duration {
        self.processing_budget + self.request_margin
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.core_base_url, "http://127.0.0.1:8090");
        assert_eq!(config.delivery_policy, DeliveryPolicy::Queue);
        assert_eq!(config.retry_delay, Duration::from_secs(3));
        assert_eq!(config.drain_interval, Duration::from_secs(2));
        assert_eq!(config.max_retry_window, Duration::from_secs(60));
        assert_eq!(config.health_timeout, Duration::from_secs(2));
        assert_eq!(config.restart_delay, Duration::from_secs(2));
        assert_eq!(config.crash_loop_threshold, 5);
        assert_eq!(config.diagnostic_capacity, 2000);
        assert_eq!(config.remediation_max_attempts, 3);
        assert_eq!(config.remediation_cooldown, Duration::from_secs(120));
        assert_eq!(config.remediation_timeout, Duration::from_secs(180));
        assert!(!config.auto_remediate);
        assert!(config.core_binary.ends_with("target/debug/core-worker"));
        assert_eq!(config.core_request_timeout(), Duration::from_secs(130));
        assert!(config.channel_webhook_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("CORE_PORT", "7001"),
            ("DELIVERY_POLICY", "fallback"),
            ("FALLBACK_ARGS", "--model, fast ,,--yes"),
            ("AUTO_REMEDIATE", "true"),
            ("ADMIN_CHAT_ID", "ops"),
            ("CHANNEL_WEBHOOK_URL", "  "),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.core_base_url, "http://127.0.0.1:7001");
        assert_eq!(config.delivery_policy, DeliveryPolicy::Fallback);
        assert_eq!(config.fallback_args, vec!["--model", "fast", "--yes"]);
        assert!(config.auto_remediate);
        assert_eq!(config.admin_chat_id.as_deref(), Some("ops"));
        assert!(config.channel_webhook_url.is_none());
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = config(&[("DELIVERY_POLICY", "both")]).unwrap_err();
        assert!(err.to_string().contains("DELIVERY_POLICY"));

        let err = config(&[("CRASH_LOOP_THRESHOLD", "five")]).unwrap_err();
        assert!(err.to_string().contains("CRASH_LOOP_THRESHOLD=five"));
    }
}
