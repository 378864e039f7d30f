//! One-shot invocation of an external agent CLI with a hard deadline.
//!
//! Used by the fallback delivery path and by remediation. The prompt is
//! passed as the last argument; stdout and stderr are captured while the
//! process runs so output written before a timeout kill is not lost.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, warn};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binary, fixed arguments and working directory of an agent CLI.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutput {
    /// `None` when the process was killed or terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl InvocationOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, prompt: &str, timeout: Duration)
        -> Result<InvocationOutput, InvokeError>;
}

pub struct CliInvoker {
    command: AgentCommand,
}

impl CliInvoker {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentInvoker for CliInvoker {
    async fn invoke(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<InvocationOutput, InvokeError> {
        let mut child = Command::new(&self.command.binary)
            .args(&self.command.args)
            .arg(prompt)
            .current_dir(&self.command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InvokeError::Spawn {
                binary: self.command.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                warn!(
                    binary = %self.command.binary,
                    timeout_secs = timeout.as_secs(),
                    "agent invocation timed out; killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(binary = %self.command.binary, "failed to kill agent: {e}");
                }
                (None, true)
            }
        };

        let output = InvocationOutput {
            exit_code,
            stdout: join_output(stdout).await,
            stderr: join_output(stderr).await,
            timed_out,
        };
        debug!(
            binary = %self.command.binary,
            exit_code = ?output.exit_code,
            stdout_len = output.stdout.len(),
            "agent invocation finished"
        );
        Ok(output)
    }
}

/// Reader task plus the bytes it has seen so far.
struct Captured {
    bytes: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

fn collect<R>(mut stream: R) -> Captured
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bytes);
    let reader = tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("agent output read stopped early: {e}");
                    break;
                }
            }
        }
    });
    Captured { bytes, reader }
}

/// Grandchildren may keep the pipe open after the agent exits, so the wait
/// for EOF is bounded and whatever arrived by then is returned.
async fn join_output(captured: Option<Captured>) -> String {
    let Some(Captured { bytes, reader }) = captured else {
        return String::new();
    };
    let abort = reader.abort_handle();
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader)
        .await
        .is_err()
    {
        abort.abort();
    }
    let captured = bytes.lock().unwrap_or_else(|e| e.into_inner());
    let text = String::from_utf8_lossy(&captured).into_owned();
    text
}
