//! Process supervisor for external backends.
//!
//! The supervisor is the only owner of a child's pipes:
//! - stdin belongs to a writer task fed through an mpsc channel, which
//!   serialises concurrent calls onto the single transport
//! - stdout belongs to a reader task that hands every response to the Router
//! - stderr is drained line by line into the log and a bounded tail buffer
//!
//! A supervision task owns the `Child` itself. On an unexpected exit, or when
//! stdout closes or turns unreadable while the process lives on, it degrades
//! the backend, fails the in-flight calls and, when a restart policy is
//! configured, relaunches with exponential backoff. Stopping closes stdin,
//! signals the process group with SIGTERM, waits out the grace window and
//! finishes with SIGKILL.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::FrameCodec;
use super::errors::ProxyError;
use super::lock;
use super::router::Router;
use super::types::{error_codes, BackendState, CommandSpec, Message, Response, StateCell};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Messages queued for a backend's stdin before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// How long the reader may keep draining stdout after the process exited.
const READER_SETTLE: Duration = Duration::from_millis(250);

/// How long a process whose stdout ended may take to exit on its own.
const EXIT_SETTLE: Duration = Duration::from_millis(250);

/// How long to wait for stderr to reach EOF after an exit.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Used when the proxy itself has no PATH.
const FALLBACK_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// A process exiting within this window counts as a failed launch.
    pub startup_probe: Duration,
    pub max_frame_bytes: usize,
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Per-launch I/O tasks of the current child.
struct ProcessIo {
    pid: Option<u32>,
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl ProcessIo {
    fn abort(self) {
        self.writer.abort();
        self.reader.abort();
        self.stderr.abort();
    }
}

/// A launched child plus the signal its stdout reader fires when it stops.
struct Launched {
    child: Child,
    transport_lost: oneshot::Receiver<String>,
}

/// Handle on the supervision task.
struct Control {
    stop_tx: oneshot::Sender<Duration>,
    task: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    backend: String,
    spec: CommandSpec,
    router: Arc<Router>,
    state: StateCell,
    settings: SupervisorSettings,
    io: Mutex<Option<ProcessIo>>,
    control: Mutex<Option<Control>>,
    restarts: AtomicU32,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessSupervisor {
    pub fn new(
        backend: &str,
        spec: CommandSpec,
        router: Arc<Router>,
        state: StateCell,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.to_string(),
            spec,
            router,
            state,
            settings,
            io: Mutex::new(None),
            control: Mutex::new(None),
            restarts: AtomicU32::new(0),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        })
    }

    /// Launch the process and begin supervising it.
    ///
    /// Fails with `LaunchError` when the process cannot be spawned or exits
    /// within the startup probe window.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        {
            let mut control = lock(&self.control);
            if control.as_ref().is_some_and(|c| !c.task.is_finished()) {
                return Err(ProxyError::InvalidState {
                    backend: self.backend.clone(),
                    action: "start",
                    state: self.state.get(),
                });
            }
            *control = None;
        }

        let launched = self.launch().await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).supervise(launched, stop_rx));
        *lock(&self.control) = Some(Control { stop_tx, task });
        Ok(())
    }

    /// Stop the process: close stdin, SIGTERM the group, SIGKILL after `grace`.
    ///
    /// Also cancels a pending restart. No-op when nothing is supervised.
    pub async fn stop(&self, grace: Duration) {
        let control = lock(&self.control).take();
        if let Some(Control { stop_tx, task }) = control {
            let _ = stop_tx.send(grace);
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(backend = %self.backend, "supervision task panicked");
                }
            }
        }
        let io = lock(&self.io).take();
        if let Some(io) = io {
            io.abort();
        }
    }

    /// Queue a message for the backend's stdin.
    pub async fn send(&self, message: Message) -> Result<(), ProxyError> {
        let outbound = lock(&self.io).as_ref().map(|io| io.outbound.clone());
        let Some(outbound) = outbound else {
            return Err(self.unavailable("process is not running"));
        };
        outbound
            .send(message)
            .await
            .map_err(|_| self.unavailable("stdin is closed"))
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.io).is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.io).as_ref().and_then(|io| io.pid)
    }

    /// Successful relaunches since registration.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        lock(&self.stderr_tail).iter().cloned().collect()
    }

    fn unavailable(&self, reason: &str) -> ProxyError {
        ProxyError::BackendUnavailable {
            backend: self.backend.clone(),
            reason: reason.to_string(),
        }
    }

    fn launch_error(&self, reason: String) -> ProxyError {
        ProxyError::LaunchError {
            backend: self.backend.clone(),
            reason,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args);

        if !self.spec.inherit_env {
            cmd.env_clear();
            cmd.env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| OsString::from(FALLBACK_PATH)),
            );
            cmd.env(
                "LANG",
                std::env::var_os("LANG").unwrap_or_else(|| OsString::from("C.UTF-8")),
            );
        }
        cmd.envs(&self.spec.env);

        if let Some(dir) = &self.spec.cwd {
            cmd.current_dir(dir);
        }

        // Own process group so signals reach the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn the child, wire its pipes and run the startup probe.
    async fn launch(&self) -> Result<Launched, ProxyError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| self.launch_error(format!("cannot spawn '{}': {e}", self.spec.command)))?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(self.launch_error("failed to capture stdio pipes".into()));
        };

        lock(&self.stderr_tail).clear();
        let codec = FrameCodec::new(self.spec.framing)
            .with_max_frame_bytes(self.settings.max_frame_bytes)
            .skip_malformed_lines();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (lost_tx, transport_lost) = oneshot::channel();

        let writer = tokio::spawn(write_stdin(
            self.backend.clone(),
            FramedWrite::new(stdin, codec.clone()),
            outbound_rx,
        ));
        let reader = tokio::spawn(read_stdout(
            self.backend.clone(),
            FramedRead::new(stdout, codec),
            Arc::clone(&self.router),
            outbound.clone(),
            lost_tx,
        ));
        let mut stderr_task = tokio::spawn(drain_stderr(
            self.backend.clone(),
            stderr,
            Arc::clone(&self.stderr_tail),
        ));

        if let Ok(status) = tokio::time::timeout(self.settings.startup_probe, child.wait()).await {
            writer.abort();
            reader.abort();
            if tokio::time::timeout(STDERR_SETTLE, &mut stderr_task).await.is_err() {
                stderr_task.abort();
            }
            let detail = match status {
                Ok(status) => format!("exited during startup ({status})"),
                Err(e) => {
                    let _ = child.start_kill();
                    format!("wait failed during startup: {e}")
                }
            };
            let tail = self.stderr_tail().join("\n");
            tracing::warn!(
                backend = %self.backend,
                command = %self.spec.command,
                stderr = %tail,
                "backend failed its startup probe"
            );
            return Err(self.launch_error(format!("{detail}{}", stderr_suffix(&tail))));
        }

        *lock(&self.io) = Some(ProcessIo {
            pid,
            outbound,
            writer,
            reader,
            stderr: stderr_task,
        });
        self.state.set(BackendState::Running);
        tracing::info!(
            backend = %self.backend,
            pid = pid.unwrap_or_default(),
            command = %self.spec.command,
            "backend process started"
        );
        Ok(Launched {
            child,
            transport_lost,
        })
    }

    async fn supervise(self: Arc<Self>, launched: Launched, mut stop_rx: oneshot::Receiver<Duration>) {
        let Launched {
            mut child,
            mut transport_lost,
        } = launched;
        // Relaunch attempts are counted over the supervisor's whole run.
        let mut attempt = 0u32;
        loop {
            let status = tokio::select! {
                status = child.wait() => status,
                reason = &mut transport_lost => {
                    let reason = reason.unwrap_or_else(|_| "stdout reader stopped".to_string());
                    self.on_transport_lost(&mut child, &reason).await
                }
                request = &mut stop_rx => {
                    self.shutdown_child(&mut child, request.unwrap_or(Duration::ZERO)).await;
                    return;
                }
            };
            self.on_unexpected_exit(status).await;

            let Some(policy) = self.spec.restart else {
                return;
            };
            Launched {
                child,
                transport_lost,
            } = loop {
                attempt += 1;
                if attempt > policy.max_attempts {
                    tracing::error!(
                        backend = %self.backend,
                        attempts = policy.max_attempts,
                        "restart attempts exhausted, backend stays degraded"
                    );
                    return;
                }
                let delay = policy.delay_for(attempt);
                tracing::info!(
                    backend = %self.backend,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling backend restart"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut stop_rx => return,
                }

                self.state.set(BackendState::Starting);
                match self.launch().await {
                    Ok(launched) => {
                        self.restarts.fetch_add(1, Ordering::Relaxed);
                        break launched;
                    }
                    Err(e) => {
                        tracing::warn!(backend = %self.backend, attempt, error = %e, "restart failed");
                        self.state.set(BackendState::Degraded);
                    }
                }
            };
        }
    }

    /// The stdout reader stopped. A process still running `EXIT_SETTLE`
    /// later is killed along with its group.
    async fn on_transport_lost(&self, child: &mut Child, reason: &str) -> std::io::Result<ExitStatus> {
        if let Ok(status) = tokio::time::timeout(EXIT_SETTLE, child.wait()).await {
            return status;
        }
        tracing::warn!(
            backend = %self.backend,
            reason,
            "backend transport lost while the process is running, killing it"
        );
        #[cfg(unix)]
        signal_group(&self.backend, child.id(), nix::sys::signal::Signal::SIGKILL);
        if let Err(e) = child.start_kill() {
            tracing::debug!(backend = %self.backend, error = %e, "kill after transport loss failed");
        }
        child.wait().await
    }

    async fn on_unexpected_exit(&self, status: std::io::Result<ExitStatus>) {
        let io = lock(&self.io).take();
        if let Some(ProcessIo {
            writer,
            mut reader,
            mut stderr,
            ..
        }) = io
        {
            writer.abort();
            // Responses written just before the exit are still delivered.
            if tokio::time::timeout(READER_SETTLE, &mut reader).await.is_err() {
                reader.abort();
            }
            if tokio::time::timeout(STDERR_SETTLE, &mut stderr).await.is_err() {
                stderr.abort();
            }
        }

        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        tracing::warn!(
            backend = %self.backend,
            status = %status,
            stderr = %self.stderr_tail().join("\n"),
            "backend process exited unexpectedly"
        );
        self.state.set(BackendState::Degraded);
        self.router.fail_all("backend process exited");
    }

    async fn shutdown_child(&self, child: &mut Child, grace: Duration) {
        let io = lock(&self.io).take();
        // Dropping the writer closes the child's stdin.
        if let Some(io) = &io {
            io.writer.abort();
        }

        let pid = child.id();
        tracing::info!(
            backend = %self.backend,
            pid = pid.unwrap_or_default(),
            grace_ms = grace.as_millis() as u64,
            "stopping backend process"
        );

        #[cfg(unix)]
        signal_group(&self.backend, pid, nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        let exited = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.backend, status = %status, "backend exited after SIGTERM");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %self.backend, error = %e, "wait failed after SIGTERM");
                false
            }
            Err(_) => {
                tracing::warn!(
                    backend = %self.backend,
                    "backend did not exit within the grace window, sending SIGKILL"
                );
                false
            }
        };

        if !exited {
            #[cfg(unix)]
            signal_group(&self.backend, pid, nix::sys::signal::Signal::SIGKILL);
            if let Err(e) = child.kill().await {
                tracing::debug!(backend = %self.backend, error = %e, "kill after SIGKILL failed");
            }
        }

        if let Some(io) = io {
            io.abort();
        }
        self.router.fail_all("backend stopped");
    }
}

#[cfg(unix)]
fn signal_group(backend: &str, pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(backend, pid, signal = ?signal, error = ?e, "killpg failed");
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── I/O Tasks ───────────────────────────────────────────────────────────────

async fn write_stdin(
    backend: String,
    mut sink: FramedWrite<ChildStdin, FrameCodec>,
    mut outbound: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::warn!(backend = %backend, error = %e, "failed to write to backend stdin");
            break;
        }
    }
}

async fn read_stdout(
    backend: String,
    mut stream: FramedRead<ChildStdout, FrameCodec>,
    router: Arc<Router>,
    outbound: mpsc::Sender<Message>,
    lost: oneshot::Sender<String>,
) {
    let reason = loop {
        let Some(frame) = stream.next().await else {
            break "stdout closed".to_string();
        };
        match frame {
            Ok(Message::Response(response)) => {
                router.complete(response);
            }
            Ok(Message::Request(request)) => {
                // Backends may not call back into clients through the proxy.
                tracing::debug!(
                    backend = %backend,
                    method = %request.method,
                    "rejecting server-initiated request"
                );
                let reply = Response::error(
                    request.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not supported by proxy: {}", request.method),
                );
                if outbound.send(Message::Response(reply)).await.is_err() {
                    break "stdin closed".to_string();
                }
            }
            Ok(Message::Notification(notification)) => {
                tracing::debug!(
                    backend = %backend,
                    method = %notification.method,
                    "dropping backend notification"
                );
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "unreadable backend output, closing transport");
                break format!("unreadable output: {e}");
            }
        }
    };
    tracing::debug!(backend = %backend, reason = %reason, "backend stdout reader stopped");
    let _ = lost.send(reason);
}

async fn drain_stderr(backend: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(backend = %backend, line = %line, "backend stderr");
                let mut tail = lock(&tail);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(backend = %backend, error = %e, "stopped reading backend stderr");
                break;
            }
        }
    }
}

// ─── Executable Resolution ───────────────────────────────────────────────────

/// Locate the program a `CommandSpec` would run, the way the spawn will.
///
/// Commands with a path separator are taken as paths (relative ones against
/// `cwd`); bare names are searched on a `PATH` set in `env` or the
/// proxy's own `PATH`.
pub fn resolve_executable(spec: &CommandSpec) -> Option<PathBuf> {
    let command = Path::new(&spec.command);
    if command.components().count() > 1 || command.is_absolute() {
        let candidate = match &spec.cwd {
            Some(cwd) if command.is_relative() => cwd.join(command),
            _ => command.to_path_buf(),
        };
        return is_executable(&candidate).then_some(candidate);
    }

    let search_path = spec
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| OsString::from(FALLBACK_PATH));
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
