use std::time::Duration;

use tracing::debug;

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Stateless liveness check against the core's `/health` endpoint.
///
/// One GET, no retries. Any error, timeout or non-2xx status is `false`.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!(url = %self.url, "health probe failed: {e}");
                false
            }
        }
    }
}
