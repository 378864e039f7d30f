use std::{sync::Arc, time::Duration};

use shared_types::{CoreReply, IncomingMessage};
use tracing::{error, info, warn};

use crate::{
    invoke::AgentInvoker,
    supervisor::{tail_chars, DiagnosticsSource},
};

/// Fixed reply when neither the core nor the fallback agent could answer.
pub const FALLBACK_APOLOGY: &str =
    "Sorry, I couldn't process your message right now. Please try again in a moment.";

/// Characters of the core's last error passed to the fallback agent.
const CONTEXT_TAIL_CHARS: usize = 1000;

/// Answers a message directly through a local agent CLI, bypassing the core.
pub struct FallbackPath {
    invoker: Arc<dyn AgentInvoker>,
    diagnostics: Arc<dyn DiagnosticsSource>,
    timeout: Duration,
}

impl FallbackPath {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        diagnostics: Arc<dyn DiagnosticsSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            invoker,
            diagnostics,
            timeout,
        }
    }

    /// Never fails: any problem becomes [`FALLBACK_APOLOGY`].
    pub async fn respond(&self, message: &IncomingMessage) -> CoreReply {
        let last_error = self.diagnostics.last_error();
        let prompt = build_fallback_prompt(message, last_error.as_deref());

        match self.invoker.invoke(&prompt, self.timeout).await {
            Ok(output) if !output.stdout.trim().is_empty() => {
                info!(
                    message_id = %message.id,
                    exit_code = ?output.exit_code,
                    "answered through fallback agent"
                );
                CoreReply::text(output.stdout.trim())
            }
            Ok(output) => {
                warn!(
                    message_id = %message.id,
                    exit_code = ?output.exit_code,
                    timed_out = output.timed_out,
                    stderr = %tail_chars(output.stderr.trim(), 500),
                    "fallback agent produced no answer"
                );
                CoreReply::text(FALLBACK_APOLOGY)
            }
            Err(e) => {
                error!(message_id = %message.id, "fallback agent failed: {e}");
                CoreReply::text(FALLBACK_APOLOGY)
            }
        }
    }
}

pub fn build_fallback_prompt(message: &IncomingMessage, last_error: Option<&str>) -> String {
    let mut prompt = String::from(
        "The primary assistant process is currently unavailable, so you are answering directly.\n",
    );
    if let Some(err) = last_error.map(str::trim).filter(|e| !e.is_empty()) {
        prompt.push_str("Its most recent error output was:\n```\n");
        prompt.push_str(tail_chars(err, CONTEXT_TAIL_CHARS));
        prompt.push_str("\n```\n");
    }
    if !message.attachments.is_empty() {
        prompt.push_str("The user attached: ");
        prompt.push_str(&message.attachments.join(", "));
        prompt.push('\n');
    }
    prompt.push_str("\nReply to the user's message below.\n\nUser message:\n");
    prompt.push_str(&message.text);
    prompt
}
