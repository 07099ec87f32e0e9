// ABOUTME: runs accepted commands as child processes with a deadline, bounded output and a concurrency cap.
// ABOUTME: timeout and caller-disconnect cleanup share one process-group termination path.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use savalet_common::{ExecuteResult, Outcome, NO_EXIT_CODE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::policy::Accepted;

const READ_CHUNK: usize = 8192;

/// Executes a request that already passed the allow-list.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, accepted: Accepted) -> ExecuteResult;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
    pub kill_grace: Duration,
    pub path: String,
    pub env: BTreeMap<String, String>,
}

impl From<&DaemonConfig> for SupervisorConfig {
    fn from(config: &DaemonConfig) -> Self {
        SupervisorConfig {
            max_output_bytes: config.limits.max_output_bytes,
            max_concurrent: config.limits.max_concurrent,
            max_queued: config.limits.max_queued,
            kill_grace: config.limits.kill_grace(),
            path: config.environment.path.clone(),
            env: config.environment.env.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    slots: Semaphore,
    queued: AtomicUsize,
}

struct QueueTicket<'a>(&'a AtomicUsize);

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Supervisor {
            slots: Semaphore::new(config.max_concurrent),
            queued: AtomicUsize::new(0),
            config,
        }
    }

    /// Takes a free slot, or waits for one if the queue has room; otherwise fails fast.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>, String> {
        if let Ok(permit) = self.slots.try_acquire() {
            return Ok(permit);
        }

        let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
        let _ticket = QueueTicket(&self.queued);
        if waiting >= self.config.max_queued {
            return Err(format!(
                "mediator saturated: {} running, {} queued",
                self.config.max_concurrent, self.config.max_queued
            ));
        }
        self.slots
            .acquire()
            .await
            .map_err(|_| "mediator is shutting down".to_string())
    }

    fn command(&self, accepted: &Accepted) -> Command {
        let mut cmd = Command::new(&accepted.program);
        cmd.args(&accepted.args)
            .env_clear()
            .env("PATH", &self.config.path)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }
}

#[async_trait]
impl Runner for Supervisor {
    async fn run(&self, accepted: Accepted) -> ExecuteResult {
        let _permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(reason) => {
                warn!(command = %accepted.command, %reason, "execution rejected");
                return ExecuteResult::saturated(reason);
            }
        };

        let child = match self.command(&accepted).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %accepted.command, program = %accepted.program, error = %err, "spawn failed");
                return ExecuteResult::spawn_failed(format!("spawn {} failed: {err}", accepted.program));
            }
        };

        let execution = InFlightExecution::start(
            accepted.command.clone(),
            child,
            accepted.timeout,
            self.config.max_output_bytes,
        );
        execution.finish(self.config.kill_grace).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    Completed,
    TimedOut,
    Orphaned,
    Killed,
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Drains a child pipe to EOF, keeping at most `limit` bytes so the child never blocks on a full pipe.
fn spawn_capture<R>(reader: Option<R>, limit: usize) -> (Arc<Mutex<Capture>>, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let capture = Arc::new(Mutex::new(Capture::default()));
    let Some(mut reader) = reader else {
        return (capture, None);
    };

    let sink = Arc::clone(&capture);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(&buf[..n], limit),
                Err(err) => {
                    debug!(error = %err, "capture read failed");
                    break;
                }
            }
        }
    });
    (capture, Some(task))
}

fn take_capture(capture: &Mutex<Capture>) -> (Vec<u8>, bool) {
    let mut capture = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    (std::mem::take(&mut capture.bytes), capture.truncated)
}

/// One spawned child from spawn until it has been reaped or killed.
///
/// Dropping it while still running (the caller went away) kills the whole process group.
struct InFlightExecution {
    command: String,
    child: Child,
    pgid: Option<i32>,
    deadline: Instant,
    state: ExecutionState,
    timed_out: bool,
    started: Instant,
    stdout: Arc<Mutex<Capture>>,
    stderr: Arc<Mutex<Capture>>,
    readers: Vec<JoinHandle<()>>,
}

impl InFlightExecution {
    fn start(command: String, mut child: Child, timeout: Duration, limit: usize) -> Self {
        let started = Instant::now();
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        let (stdout, stdout_task) = spawn_capture(child.stdout.take(), limit);
        let (stderr, stderr_task) = spawn_capture(child.stderr.take(), limit);
        info!(command = %command, pid = ?pgid, timeout_secs = timeout.as_secs(), "spawned");

        InFlightExecution {
            command,
            child,
            pgid,
            deadline: started + timeout,
            state: ExecutionState::Running,
            timed_out: false,
            started,
            stdout,
            stderr,
            readers: stdout_task.into_iter().chain(stderr_task).collect(),
        }
    }

    fn transition(&mut self, next: ExecutionState) {
        debug!(command = %self.command, pid = ?self.pgid, from = ?self.state, to = ?next, "execution state");
        self.state = next;
    }

    fn signal_group(&self, signal: libc::c_int) {
        let Some(pgid) = self.pgid else {
            return;
        };
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            debug!(pgid, signal, error = %std::io::Error::last_os_error(), "signal process group failed");
        }
    }

    /// SIGTERM the group, give it `grace` to exit, then SIGKILL and reap.
    async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.signal_group(libc::SIGTERM);
        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        if let Ok(Ok(status)) = waited {
            self.signal_group(libc::SIGKILL);
            self.transition(ExecutionState::Killed);
            return Some(status);
        }

        warn!(command = %self.command, pid = ?self.pgid, "still running after grace period, sending SIGKILL");
        self.signal_group(libc::SIGKILL);
        let _ = self.child.start_kill();
        let status = self.child.wait().await.ok();
        self.transition(ExecutionState::Killed);
        status
    }

    async fn finish(mut self, grace: Duration) -> ExecuteResult {
        let mut reason = None;
        let waited = tokio::time::timeout_at(self.deadline, self.child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => {
                self.transition(ExecutionState::Completed);
                Some(status)
            }
            Ok(Err(err)) => {
                warn!(command = %self.command, error = %err, "wait failed");
                reason = Some(format!("wait failed: {err}"));
                self.terminate(grace).await
            }
            Err(_) => {
                warn!(command = %self.command, pid = ?self.pgid, "deadline reached, terminating");
                self.timed_out = true;
                self.transition(ExecutionState::TimedOut);
                self.terminate(grace).await
            }
        };

        self.drain_readers(grace).await;

        let outcome = if self.timed_out {
            Outcome::TimedOut
        } else {
            Outcome::Completed
        };
        let exit_code = status.and_then(|s| s.code()).unwrap_or(NO_EXIT_CODE);
        if reason.is_none() {
            reason = status.and_then(describe_signal);
        }

        let (stdout, stdout_truncated) = take_capture(&self.stdout);
        let (stderr, stderr_truncated) = take_capture(&self.stderr);
        info!(
            command = %self.command,
            pid = ?self.pgid,
            exit_code,
            outcome = %outcome,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "execution finished"
        );

        ExecuteResult {
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            outcome,
            reason,
        }
    }

    /// Pipes stay open while anything in the group still holds them; leftovers get killed.
    ///
    /// Handles stay in `self.readers` until drained, so a drop mid-drain still reaches the group.
    async fn drain_readers(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for reader in self.readers.iter_mut() {
            let _ = tokio::time::timeout_at(deadline, reader).await;
        }
        if self.readers.iter().all(JoinHandle::is_finished) {
            self.readers.clear();
            return;
        }

        warn!(command = %self.command, pid = ?self.pgid, "output pipes held open after exit, killing process group");
        self.signal_group(libc::SIGKILL);
        let deadline = Instant::now() + grace;
        for reader in self.readers.iter_mut().filter(|r| !r.is_finished()) {
            let _ = tokio::time::timeout_at(deadline, reader).await;
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for InFlightExecution {
    fn drop(&mut self) {
        if matches!(self.state, ExecutionState::Running | ExecutionState::TimedOut) {
            self.transition(ExecutionState::Orphaned);
            warn!(command = %self.command, pid = ?self.pgid, "caller went away, killing orphaned process group");
            self.signal_group(libc::SIGKILL);
            let _ = self.child.start_kill();
            self.transition(ExecutionState::Killed);
        } else if !self.readers.is_empty() {
            warn!(command = %self.command, pid = ?self.pgid, "caller went away while output was draining, killing process group");
            self.signal_group(libc::SIGKILL);
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn describe_signal(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| format!("terminated by signal {sig}"))
}
