use std::{collections::HashMap, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
};
use tracing::error;

pub type StderrStream = Box<dyn AsyncRead + Send + Unpin>;

/// A running worker instance as seen by the supervisor.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Hand over the error stream. Returns `None` after the first call.
    fn take_stderr(&mut self) -> Option<StderrStream>;

    /// Wait for the process to exit and return its exit code, if it had one.
    /// Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Capability to start a new worker instance.
pub trait Spawner: Send + Sync {
    fn spawn(&self) -> std::io::Result<Box<dyn WorkerProcess>>;
}

/// Spawns the core binary as a child process.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    binary: String,
    args: Vec<String>,
    port: u16,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandSpawner {
    pub fn new(binary: String, args: Vec<String>, port: u16) -> Self {
        Self {
            binary,
            args,
            port,
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self) -> std::io::Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .env("PORT", self.port.to_string())
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            error!(port = self.port, binary = %self.binary, "failed to spawn core: {e}");
            e
        })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stderr(&mut self) -> Option<StderrStream> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as StderrStream)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_command_spawner_pipes_stderr_and_reports_exit_code() {
        let spawner = CommandSpawner::new(
            "sh".to_string(),
            vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            0,
        );
        let mut process = spawner.spawn().unwrap();
        assert!(process.id().is_some());

        let mut stderr = process.take_stderr().unwrap();
        assert!(process.take_stderr().is_none());

        let mut captured = String::new();
        stderr.read_to_string(&mut captured).await.unwrap();
        let code = process.wait().await.unwrap();

        assert_eq!(captured.trim(), "boom");
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_command_spawner_missing_binary_is_an_error() {
        let spawner = CommandSpawner::new("/nonexistent/core-worker".to_string(), Vec::new(), 0);
        assert!(spawner.spawn().is_err());
    }
}
