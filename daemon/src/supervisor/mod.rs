//! Core process lifecycle: spawn, exit detection, crash-loop detection,
//! bounded stderr capture and restart scheduling.

pub mod diagnostics;
pub mod spawn;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

pub use diagnostics::{tail_chars, DiagnosticBuffer, DEFAULT_DIAGNOSTIC_CAPACITY};
pub use spawn::{CommandSpawner, Spawner, StderrStream, WorkerProcess};

/// How long an exit observer waits for the stderr reader to hit EOF.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;

/// Read-only view of the supervised worker, shared with the delivery
/// pipeline and the remediation trigger.
pub trait DiagnosticsSource: Send + Sync {
    fn is_up(&self) -> bool;

    /// Stderr tail captured at the most recent exit.
    fn last_error(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Running => write!(f, "running"),
            DesiredState::Stopped => write!(f, "stopped"),
        }
    }
}

impl serde::Serialize for DesiredState {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Label used in logs and status output
    pub role: String,
    /// Delay between an unexpected exit and the next spawn
    pub restart_delay: Duration,
    /// Exits closer together than this count toward a crash loop
    pub crash_loop_window: Duration,
    /// Consecutive close exits that raise the crash-loop warning
    pub crash_loop_threshold: u32,
    /// Characters of stderr kept for diagnostics
    pub diagnostic_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            role: "core".to_string(),
            restart_delay: Duration::from_secs(2),
            crash_loop_window: Duration::from_secs(10),
            crash_loop_threshold: 5,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { pid: Option<u32> },
    /// Unexpected exit. `crash_count` is the value after this exit.
    Exited {
        code: Option<i32>,
        crash_count: u32,
    },
    CrashLoop { crash_count: u32 },
    RestartScheduled { delay: Duration },
    SpawnFailed { error: String },
    /// Exit requested through `stop()`.
    Stopped,
}

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

struct SupervisedProcess {
    handle: Option<ProcessHandle>,
    started_at: Option<Instant>,
    crash_count: u32,
    last_crash_at: Option<Instant>,
    desired: DesiredState,
    last_error: Option<String>,
    generation: u64,
    /// Generation killed by `stop()` whose exit has not been observed yet
    exiting: Option<u64>,
    restart_task: Option<JoinHandle<()>>,
}

/// Owns the single core process. At most one instance is alive at a time.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    spawner: Arc<dyn Spawner>,
    clock: Arc<dyn Clock>,
    state: Mutex<SupervisedProcess>,
    diagnostics: Arc<Mutex<DiagnosticBuffer>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        spawner: Arc<dyn Spawner>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let diagnostics = Arc::new(Mutex::new(DiagnosticBuffer::new(
            config.diagnostic_capacity,
        )));
        Arc::new(Self {
            config,
            spawner,
            clock,
            state: Mutex::new(SupervisedProcess {
                handle: None,
                started_at: None,
                crash_count: 0,
                last_crash_at: None,
                desired: DesiredState::Running,
                last_error: None,
                generation: 0,
                exiting: None,
                restart_task: None,
            }),
            diagnostics,
            events,
        })
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Spawn the core unless it is already running or has been stopped.
    ///
    /// While a stopped instance is still exiting the spawn is deferred to its
    /// exit observer, so two instances never overlap.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.desired == DesiredState::Stopped || state.handle.is_some() {
            return;
        }
        if let Some(generation) = state.exiting {
            debug!(role = %self.config.role, generation, "previous core still exiting; start deferred");
            return;
        }
        if let Some(pending) = state.restart_task.take() {
            pending.abort();
        }
        self.spawn_locked(&mut state);
    }

    /// Mark the core as wanted again and start it.
    pub fn resume(self: &Arc<Self>) {
        self.lock_state().desired = DesiredState::Running;
        self.start();
    }

    /// Terminate the core. No restart is scheduled afterwards.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.desired = DesiredState::Stopped;
        if let Some(pending) = state.restart_task.take() {
            pending.abort();
        }
        if let Some(mut handle) = state.handle.take() {
            info!(role = %self.config.role, pid = ?handle.pid, "stopping core");
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
            state.exiting = Some(handle.generation);
        }
        state.started_at = None;
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.lock_state();
        SupervisorStatus {
            role: self.config.role.clone(),
            up: state.handle.is_some(),
            pid: state.handle.as_ref().and_then(|h| h.pid),
            uptime_secs: state
                .started_at
                .map(|at| self.clock.now().saturating_duration_since(at).as_secs()),
            crash_count: state.crash_count,
            desired: state.desired,
            last_error: state.last_error.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisedProcess> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn spawn_locked(self: &Arc<Self>, state: &mut SupervisedProcess) {
        let role = self.config.role.as_str();
        let mut process = match self.spawner.spawn() {
            Ok(process) => process,
            Err(e) => {
                error!(role, "core spawn failed: {e}");
                self.emit(SupervisorEvent::SpawnFailed {
                    error: e.to_string(),
                });
                if state.desired == DesiredState::Running {
                    self.schedule_restart(state);
                }
                return;
            }
        };

        state.generation += 1;
        let generation = state.generation;
        let pid = process.id();
        let stderr = process.take_stderr();
        let (kill_tx, kill_rx) = oneshot::channel();

        state.handle = Some(ProcessHandle {
            generation,
            pid,
            kill: Some(kill_tx),
        });
        state.started_at = Some(self.clock.now());

        info!(role, pid = ?pid, generation, "core started");
        self.emit(SupervisorEvent::Started { pid });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor
                .observe(generation, process, stderr, kill_rx)
                .await;
        });
    }

    async fn observe(
        self: Arc<Self>,
        generation: u64,
        mut process: Box<dyn WorkerProcess>,
        stderr: Option<StderrStream>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let role = self.config.role.clone();
        let reader = stderr.map(|stream| {
            tokio::spawn(capture_stderr(
                stream,
                Arc::clone(&self.diagnostics),
                role.clone(),
            ))
        });

        let exited = tokio::select! {
            status = process.wait() => Some(status),
            _ = &mut kill_rx => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                if let Err(e) = process.kill().await {
                    warn!(role = %role, "failed to kill core: {e}");
                }
                process.wait().await
            }
        };
        let code = match status {
            Ok(code) => code,
            Err(e) => {
                warn!(role = %role, "failed to collect core exit status: {e}");
                None
            }
        };

        if let Some(reader) = reader {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader)
                .await
                .is_err()
            {
                debug!(role = %role, "stderr still open after exit; snapshotting what we have");
            }
        }

        self.handle_exit(generation, code);
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
        let now = self.clock.now();
        let snapshot = self
            .diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        let role = self.config.role.as_str();

        let mut state = self.lock_state();
        if !snapshot.is_empty() {
            state.last_error = Some(snapshot);
        }

        let current = state
            .handle
            .as_ref()
            .is_some_and(|handle| handle.generation == generation);
        if !current {
            info!(role, code = ?code, "core stopped");
            self.emit(SupervisorEvent::Stopped);
            if state.exiting == Some(generation) {
                state.exiting = None;
                if state.desired == DesiredState::Running && state.handle.is_none() {
                    self.spawn_locked(&mut state);
                }
            }
            return;
        }

        state.handle = None;
        state.started_at = None;
        state.crash_count = match state.last_crash_at {
            Some(previous) if now.saturating_duration_since(previous) < self.config.crash_loop_window => {
                state.crash_count + 1
            }
            _ => 1,
        };
        state.last_crash_at = Some(now);
        let crash_count = state.crash_count;

        warn!(role, code = ?code, crash_count, "core exited");
        self.emit(SupervisorEvent::Exited { code, crash_count });

        if crash_count == self.config.crash_loop_threshold {
            warn!(
                role,
                crash_count,
                window_secs = self.config.crash_loop_window.as_secs(),
                "core is crash looping"
            );
            self.emit(SupervisorEvent::CrashLoop { crash_count });
        }

        if state.desired == DesiredState::Running {
            self.schedule_restart(&mut state);
        }
    }

    fn schedule_restart(self: &Arc<Self>, state: &mut SupervisedProcess) {
        let delay = self.config.restart_delay;
        if let Some(previous) = state.restart_task.take() {
            previous.abort();
        }
        debug!(role = %self.config.role, delay_ms = delay.as_millis() as u64, "restart scheduled");
        self.emit(SupervisorEvent::RestartScheduled { delay });

        let supervisor = Arc::clone(self);
        state.restart_task = Some(tokio::spawn(async move {
            supervisor.clock.sleep(delay).await;
            supervisor.start();
        }));
    }
}

impl DiagnosticsSource for ProcessSupervisor {
    fn is_up(&self) -> bool {
        self.lock_state().handle.is_some()
    }

    fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }
}

async fn capture_stderr(
    mut stream: StderrStream,
    buffer: Arc<Mutex<DiagnosticBuffer>>,
    role: String,
) {
    let mut chunk = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(role = %role, "stderr read failed: {e}");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..read]);

        // Hold back a multi-byte character split across reads.
        let complete = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => pending.len(),
        };
        let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
        pending.drain(..complete);

        debug!(role = %role, "stderr: {}", text.trim_end());
        buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(&text);
    }
    if !pending.is_empty() {
        buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_bytes(&pending);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub role: String,
    pub up: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub crash_count: u32,
    pub desired: DesiredState,
    pub last_error: Option<String>,
}
