//! Rate-limited automatic repair: hands the core's crash output to an
//! external agent and reports what happened through a notification sink.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    invoke::{AgentInvoker, InvocationOutput},
    supervisor::{tail_chars, DiagnosticsSource, SupervisorEvent},
};

/// Path-like tokens with at least one directory and an extension, with an
/// optional `:line[:col]` suffix that is discarded.
static FILE_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(/?(?:[A-Za-z0-9_.\-]+/)+[A-Za-z0-9_\-]+\.[A-Za-z]{1,6})(?::\d+)*")
        .expect("valid regex")
});

/// Opaque text sink for operator-facing notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

#[derive(Debug, Clone)]
pub struct RemediationConfig {
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub timeout: Duration,
    /// Characters of diagnostic text embedded in the prompt
    pub diagnostic_tail: usize,
    pub max_file_hints: usize,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(120),
            timeout: Duration::from_secs(180),
            diagnostic_tail: 1500,
            max_file_hints: 5,
        }
    }
}

/// Attempt counter with a cooldown reset.
#[derive(Debug, Clone)]
pub struct RemediationWindow {
    pub attempt_count: u32,
    pub last_attempt_at: Option<Instant>,
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RemediationWindow {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            attempt_count: 0,
            last_attempt_at: None,
            max_attempts,
            cooldown,
        }
    }

    /// Apply the cooldown reset, then claim an attempt. Returns the attempt
    /// number, or `None` when the cap is reached.
    pub fn admit(&mut self, now: Instant) -> Option<u32> {
        if let Some(last) = self.last_attempt_at {
            if now.saturating_duration_since(last) > self.cooldown {
                self.attempt_count = 0;
            }
        }
        if self.attempt_count >= self.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        Some(self.attempt_count)
    }
}

pub struct RemediationOrchestrator {
    invoker: Arc<dyn AgentInvoker>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RemediationConfig,
    window: Mutex<RemediationWindow>,
}

impl RemediationOrchestrator {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: RemediationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            window: Mutex::new(RemediationWindow::new(
                config.max_attempts,
                config.cooldown,
            )),
            invoker,
            notifier,
            clock,
            config,
        })
    }

    pub fn attempts_in_window(&self) -> u32 {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attempt_count
    }

    /// Run one remediation attempt for `diagnostic`.
    ///
    /// Returns `false` without spawning anything once the attempt cap is
    /// reached inside the cooldown window. Every admitted attempt ends with
    /// an outcome notice, successful or not.
    pub async fn trigger(&self, diagnostic: &str) -> bool {
        let max = self.config.max_attempts;
        let admitted = self
            .window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(self.clock.now());

        let Some(attempt) = admitted else {
            warn!(max_attempts = max, "remediation attempts exhausted");
            self.notifier
                .notify(&format!(
                    "Core remediation gave up after {max} attempts. It requires human intervention."
                ))
                .await;
            return false;
        };

        info!(attempt, max_attempts = max, "starting core remediation");
        self.notifier
            .notify(&format!("Core remediation attempt {attempt}/{max} started."))
            .await;

        let hints = extract_file_hints(diagnostic, self.config.max_file_hints);
        debug!(?hints, "remediation file hints");
        let prompt = build_remediation_prompt(diagnostic, &hints, self.config.diagnostic_tail);

        let output = match self.invoker.invoke(&prompt, self.config.timeout).await {
            Ok(output) => output,
            Err(e) => {
                error!(attempt, "remediation agent failed to run: {e}");
                self.notifier
                    .notify(&format!(
                        "Core remediation attempt {attempt}/{max} failed: {e}"
                    ))
                    .await;
                return false;
            }
        };

        let success = remediation_succeeded(&output);
        info!(
            attempt,
            success,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            "core remediation finished"
        );
        self.notifier
            .notify(&outcome_summary(attempt, max, success, &output))
            .await;
        success
    }

    /// Trigger remediation each time the supervisor reports a crash loop.
    /// Ends when `shutdown` fires or the event stream closes.
    pub async fn watch_crash_loops(
        self: Arc<Self>,
        diagnostics: Arc<dyn DiagnosticsSource>,
        mut events: broadcast::Receiver<SupervisorEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(SupervisorEvent::CrashLoop { crash_count }) => {
                    match diagnostics.last_error() {
                        Some(diagnostic) => {
                            info!(crash_count, "crash loop detected; triggering remediation");
                            self.trigger(&diagnostic).await;
                        }
                        None => warn!(crash_count, "crash loop without captured diagnostics"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "remediation watcher lagged behind supervisor events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Non-zero exit only counts as failure when the agent also said nothing.
pub fn remediation_succeeded(output: &InvocationOutput) -> bool {
    output.succeeded() || !output.stdout.trim().is_empty()
}

/// Up to `max` distinct file paths mentioned in `diagnostic`, in order of
/// first appearance.
pub fn extract_file_hints(diagnostic: &str, max: usize) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();
    for cap in FILE_HINT.captures_iter(diagnostic) {
        if hints.len() >= max {
            break;
        }
        let path = &cap[1];
        if !hints.iter().any(|h| h == path) {
            hints.push(path.to_string());
        }
    }
    hints
}

pub fn build_remediation_prompt(diagnostic: &str, hints: &[String], tail: usize) -> String {
    let mut prompt = String::from(
        "The core service keeps crashing. Diagnose the failure from its error output and apply a fix.\n\n",
    );
    prompt.push_str("Error output (most recent last):\n```\n");
    prompt.push_str(tail_chars(diagnostic.trim(), tail));
    prompt.push_str("\n```\n");

    if !hints.is_empty() {
        prompt.push_str("\nFiles mentioned in the error:\n");
        for hint in hints {
            prompt.push_str("- ");
            prompt.push_str(hint);
            prompt.push('\n');
        }
    }

    prompt.push_str(
        "\nConstraints:\n\
         - Make the minimal fix only. No refactors, no unrelated changes.\n\
         - Do not touch files unrelated to the error.\n\
         - Finish with a short summary of what you changed.\n",
    );
    prompt
}

fn outcome_summary(attempt: u32, max: u32, success: bool, output: &InvocationOutput) -> String {
    let verdict = if success { "finished" } else { "failed" };
    let mut summary = format!("Core remediation attempt {attempt}/{max} {verdict}");
    match output.exit_code {
        Some(code) => summary.push_str(&format!(" (exit {code})")),
        None if output.timed_out => summary.push_str(" (timed out)"),
        None => summary.push_str(" (killed)"),
    }

    let details = if output.stdout.trim().is_empty() {
        output.stderr.trim()
    } else {
        output.stdout.trim()
    };
    if !details.is_empty() {
        summary.push_str(":\n");
        summary.push_str(tail_chars(details, 500));
    }
    summary
}
