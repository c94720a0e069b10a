//! Interpreter process supervision
//!
//! The supervisor is the only owner of the child process. Reader tasks
//! forward stdout/stderr chunks to a demultiplexer that delivers them to the
//! single registered request route; chunks arriving with no route are
//! dropped. A waiter task observes process exit and flips the published
//! [`Lifecycle`], so every liveness check reads one source of truth.
//!
//! A request that times out is interrupted, and its sentinel is remembered.
//! Before the next request is framed, a barrier is echoed on both streams and
//! everything in front of it is discarded, so the interrupted command's late
//! output and traceback never reach an unrelated result.

use crate::bootstrap::Bootstrap;
use crate::codec::{
    frame_barrier, frame_request, ChromeFilter, Sentinel, SentinelDecoder, StderrDecoder,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::resolver::{ExecutableResolver, ResolvedExecutable};
use crate::workspace::Workspace;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_BUF_BYTES: usize = 8 * 1024;
const MAX_ABANDONED: usize = 16;

/// Environment variable overriding the configured project root
pub const PROJECT_ROOT_ENV: &str = "PYREPL_PROJECT_ROOT";

/// Observable state of the interpreter process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// No process
    Stopped,
    /// Spawned, waiting for the readiness sentinel
    Starting,
    /// Accepting commands
    Ready {
        /// Spawn counter, increments on every restart
        generation: u64,
        /// OS process id
        pid: Option<u32>,
    },
    /// The last start attempt failed
    Failed(String),
}

impl Lifecycle {
    /// Whether a live process is accepting commands
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Decoded result of one framed request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// stdout with the sentinel removed
    pub stdout: String,
    /// Filtered stderr
    pub stderr: String,
}

#[derive(Debug)]
enum StreamChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Debug, Default)]
struct Demux {
    route: StdMutex<Option<(u64, mpsc::UnboundedSender<StreamChunk>)>>,
    next_route: AtomicU64,
}

impl Demux {
    fn register(self: &Arc<Self>) -> (RouteGuard, mpsc::UnboundedReceiver<StreamChunk>) {
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut route) = self.route.lock() {
            *route = Some((id, tx));
        }
        (
            RouteGuard {
                demux: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    fn dispatch(&self, chunk: StreamChunk) {
        let Ok(route) = self.route.lock() else {
            return;
        };
        match route.as_ref() {
            Some((_, tx)) => {
                let _ = tx.send(chunk);
            }
            None => debug!(?chunk, "Discarding interpreter output with no pending request"),
        }
    }
}

/// Detaches a request route when the request settles, whichever way
struct RouteGuard {
    demux: Arc<Demux>,
    id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if let Ok(mut route) = self.demux.route.lock() {
            if route.as_ref().is_some_and(|(id, _)| *id == self.id) {
                *route = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    executable: ResolvedExecutable,
    stdin: Arc<Mutex<ChildStdin>>,
    demux: Arc<Demux>,
    exited: watch::Receiver<Option<ExitInfo>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    fn is_alive(&self) -> bool {
        self.exited.borrow().is_none()
    }

    fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// The pieces of a live process one request needs, detached from the state lock
struct Channel {
    pid: Option<u32>,
    stdin: Arc<Mutex<ChildStdin>>,
    demux: Arc<Demux>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

enum State {
    Stopped,
    Ready(ProcessHandle),
}

/// Owns the interpreter process and frames requests to it
pub struct Supervisor {
    config: Arc<SessionConfig>,
    resolver: Arc<ExecutableResolver>,
    workspace: Arc<dyn Workspace>,
    filter: ChromeFilter,
    state: Mutex<State>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    generation: AtomicU64,
    abandoned: StdMutex<Vec<Sentinel>>,
    abort_start: Notify,
}

impl Supervisor {
    /// Create a stopped supervisor
    #[must_use]
    pub fn new(
        config: Arc<SessionConfig>,
        resolver: Arc<ExecutableResolver>,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        let filter = ChromeFilter::from_config(&config);
        let (lifecycle, _) = watch::channel(Lifecycle::Stopped);
        Self {
            config,
            resolver,
            workspace,
            filter,
            state: Mutex::new(State::Stopped),
            lifecycle: Arc::new(lifecycle),
            generation: AtomicU64::new(0),
            abandoned: StdMutex::new(Vec::new()),
            abort_start: Notify::new(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    /// Subscribe to lifecycle transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Identity of the running interpreter, if any
    pub async fn executable(&self) -> Option<ResolvedExecutable> {
        match &*self.state.lock().await {
            State::Ready(handle) if handle.is_alive() => Some(handle.executable.clone()),
            _ => None,
        }
    }

    /// Start the interpreter unless a live one exists
    ///
    /// A dead process is discarded and replaced transparently.
    pub async fn ensure_started(&self) -> Result<ResolvedExecutable> {
        let mut state = self.state.lock().await;
        if let State::Ready(handle) = &*state {
            if handle.is_alive() {
                return Ok(handle.executable.clone());
            }
            warn!(
                generation = handle.generation,
                "Interpreter process has exited; restarting"
            );
        }
        if let State::Ready(dead) = std::mem::replace(&mut *state, State::Stopped) {
            dead.terminate();
        }
        self.clear_abandoned();

        self.lifecycle.send_replace(Lifecycle::Starting);
        let aborted = self.abort_start.notified();
        let spawned = tokio::select! {
            spawned = self.spawn() => spawned,
            _ = aborted => {
                info!("Interpreter startup aborted by reset");
                Err(Error::InterpreterExited { code: None })
            }
        };
        match spawned {
            Ok(handle) => {
                let executable = handle.executable.clone();
                self.lifecycle.send_replace(Lifecycle::Ready {
                    generation: handle.generation,
                    pid: handle.pid,
                });
                *state = State::Ready(handle);
                Ok(executable)
            }
            Err(e) => {
                warn!(error = %e, "Interpreter failed to start");
                self.lifecycle.send_replace(Lifecycle::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Forcibly terminate the interpreter; a no-op when none is running
    ///
    /// A start in progress is aborted and its process killed.
    pub async fn reset(&self) {
        self.abort_start.notify_waiters();
        let mut state = self.state.lock().await;
        if let State::Ready(handle) = std::mem::replace(&mut *state, State::Stopped) {
            info!(
                generation = handle.generation,
                pid = ?handle.pid,
                "Terminating interpreter"
            );
            handle.terminate();
        }
        self.clear_abandoned();
        self.lifecycle.send_replace(Lifecycle::Stopped);
    }

    /// Frame `code`, write it, and race its sentinel against `timeout`
    ///
    /// Callers must hold the session gate.
    pub async fn submit(&self, code: &str, timeout: Duration) -> Result<RawOutput> {
        self.ensure_started().await?;
        let channel = self.channel().await?;
        let deadline = Instant::now() + timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let (route, mut rx) = channel.demux.register();
        let mut exited = channel.exited.clone();

        if let Err(e) = self.resync(&channel, &mut rx, &mut exited, deadline).await {
            if matches!(e, Error::ExecutionTimeout(_)) {
                warn!(timeout_ms, pid = ?channel.pid, "Interrupted command still running; interrupting again");
                if let Some(pid) = channel.pid {
                    send_interrupt(pid);
                }
                return Err(Error::ExecutionTimeout(timeout_ms));
            }
            return Err(e);
        }

        let sentinel = Sentinel::new();
        let limit = self.config.output_limit_bytes;
        let mut stdout = SentinelDecoder::new(sentinel.clone(), limit);
        let mut stderr = StderrDecoder::new(self.filter.clone(), limit);

        if let Err(e) = write_line(&channel.stdin, &frame_request(code, &sentinel)).await {
            warn!(error = %e, "Failed to write request to interpreter");
            return Err(e);
        }

        let wait = async {
            loop {
                tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(StreamChunk::Stdout(bytes)) => {
                            if stdout.push(&bytes) {
                                return Ok(());
                            }
                        }
                        Some(StreamChunk::Stderr(bytes)) => stderr.push(&bytes),
                        None => return Err(Error::InterpreterExited { code: None }),
                    },
                    changed = exited.changed() => {
                        let code = exited.borrow().and_then(|info| info.code);
                        if changed.is_err() || exited.borrow().is_some() {
                            return Err(Error::InterpreterExited { code });
                        }
                    }
                }
            }
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Interpreter exited during command");
                return Err(e);
            }
            Err(_) => {
                drop(route);
                warn!(timeout_ms, pid = ?channel.pid, "Command timed out; interrupting interpreter");
                self.abandon(sentinel);
                if let Some(pid) = channel.pid {
                    send_interrupt(pid);
                }
                return Err(Error::ExecutionTimeout(timeout_ms));
            }
        }

        let settle = Instant::now() + self.config.stderr_settle();
        while let Ok(Some(chunk)) = tokio::time::timeout_at(settle, rx.recv()).await {
            if let StreamChunk::Stderr(bytes) = chunk {
                stderr.push(&bytes);
            }
        }
        drop(route);

        Ok(RawOutput {
            stdout: stdout.finish(),
            stderr: stderr.finish(),
        })
    }

    /// Discard whatever interrupted commands still emit, up to a fresh barrier
    ///
    /// Returns immediately when no command has been abandoned.
    async fn resync(
        &self,
        channel: &Channel,
        rx: &mut mpsc::UnboundedReceiver<StreamChunk>,
        exited: &mut watch::Receiver<Option<ExitInfo>>,
        deadline: Instant,
    ) -> Result<()> {
        let stale = self.abandoned();
        if stale.is_empty() {
            return Ok(());
        }

        let barrier = Sentinel::new();
        let limit = self.config.output_limit_bytes;
        let mut stdout = SentinelDecoder::with_abandoned(barrier.clone(), stale, limit);
        let mut stderr = SentinelDecoder::new(barrier.clone(), limit);
        write_line(&channel.stdin, &frame_barrier(&barrier)).await?;

        let wait = async {
            while !(stdout.is_complete() && stderr.is_complete()) {
                tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(StreamChunk::Stdout(bytes)) => {
                            stdout.push(&bytes);
                        }
                        Some(StreamChunk::Stderr(bytes)) => {
                            stderr.push(&bytes);
                        }
                        None => return Err(Error::InterpreterExited { code: None }),
                    },
                    changed = exited.changed() => {
                        let code = exited.borrow().and_then(|info| info.code);
                        if changed.is_err() || exited.borrow().is_some() {
                            return Err(Error::InterpreterExited { code });
                        }
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(())) => {
                debug!(
                    reclaimed = stdout.reclaimed().len(),
                    "Discarded output of interrupted commands"
                );
                self.clear_abandoned();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.abandon(barrier);
                Err(Error::ExecutionTimeout(0))
            }
        }
    }

    async fn channel(&self) -> Result<Channel> {
        match &*self.state.lock().await {
            State::Ready(handle) => Ok(Channel {
                pid: handle.pid,
                stdin: Arc::clone(&handle.stdin),
                demux: Arc::clone(&handle.demux),
                exited: handle.exited.clone(),
            }),
            State::Stopped => Err(Error::InterpreterExited { code: None }),
        }
    }

    async fn spawn(&self) -> Result<ProcessHandle> {
        let executable = self.resolver.resolve().await?;

        let workspace_dir = absolute(self.config.workspace_dir());
        self.workspace.ensure_dir(&workspace_dir).await?;
        self.workspace.ensure_dir(&self.config.results_dir()).await?;

        let mut child = Command::new(&executable.program)
            .args(["-i", "-u"])
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .current_dir(&workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(Error::Io(std::io::Error::other(
                    "interpreter stdio pipes unavailable",
                )));
            }
        };

        let demux = Arc::new(Demux::default());
        tokio::spawn(pump(stdout, Arc::clone(&demux), StreamChunk::Stdout));
        tokio::spawn(pump(stderr, Arc::clone(&demux), StreamChunk::Stderr));

        let (exit_tx, exited) = watch::channel(None);
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            child,
            generation,
            kill_rx,
            exit_tx,
            Arc::clone(&self.lifecycle),
        ));

        debug!(generation, pid = ?pid, program = %executable.program.display(), "Spawned interpreter");

        let handle = ProcessHandle {
            generation,
            pid,
            executable,
            stdin: Arc::new(Mutex::new(stdin)),
            demux,
            exited,
            kill: Some(kill),
        };

        match self.handshake(&handle, &workspace_dir).await {
            Ok(()) => {
                info!(
                    generation,
                    pid = ?pid,
                    executable = %handle.executable,
                    "Interpreter ready"
                );
                Ok(handle)
            }
            Err(e) => {
                handle.terminate();
                Err(e)
            }
        }
    }

    async fn handshake(&self, handle: &ProcessHandle, workspace_dir: &std::path::Path) -> Result<()> {
        let boot = Bootstrap::new(&self.project_root(), workspace_dir);
        let limit = self.config.output_limit_bytes;
        let mut ready = SentinelDecoder::new(boot.ready_sentinel().clone(), limit);
        let mut diagnostics = StderrDecoder::new(self.filter.clone(), limit);

        let (_route, mut rx) = handle.demux.register();
        let mut exited = handle.exited.clone();

        write_line(&handle.stdin, &boot.install_line()).await?;

        let startup = self.config.startup_timeout();
        let wait = async {
            loop {
                tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(StreamChunk::Stdout(bytes)) => {
                            if ready.push(&bytes) {
                                return Ok(());
                            }
                        }
                        Some(StreamChunk::Stderr(bytes)) => diagnostics.push(&bytes),
                        None => return Err(Error::InterpreterExited { code: None }),
                    },
                    changed = exited.changed() => {
                        let code = exited.borrow().and_then(|info| info.code);
                        if changed.is_err() || exited.borrow().is_some() {
                            return Err(Error::InterpreterExited { code });
                        }
                    }
                }
            }
        };

        let outcome = match tokio::time::timeout(startup, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::StartupTimeout(self.config.startup_timeout_ms)),
        };
        if outcome.is_err() {
            let stderr = diagnostics.finish();
            if !stderr.is_empty() {
                warn!(stderr = %stderr, "Interpreter stderr during failed startup");
            }
        }
        outcome
    }

    fn project_root(&self) -> PathBuf {
        if let Some(root) = std::env::var_os(PROJECT_ROOT_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(root);
        }
        match &self.config.project_root {
            Some(root) => absolute(root.clone()),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    fn abandoned(&self) -> Vec<Sentinel> {
        self.abandoned
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    fn abandon(&self, sentinel: Sentinel) {
        if let Ok(mut list) = self.abandoned.lock() {
            if list.len() >= MAX_ABANDONED {
                list.remove(0);
            }
            list.push(sentinel);
        }
    }

    fn clear_abandoned(&self) {
        if let Ok(mut list) = self.abandoned.lock() {
            list.clear();
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, text: &str) -> Result<()> {
    let mut stdin = stdin.lock().await;
    stdin
        .write_all(text.as_bytes())
        .await
        .map_err(Error::TransportWriteFailed)?;
    stdin.flush().await.map_err(Error::TransportWriteFailed)
}

async fn pump<R>(mut reader: R, demux: Arc<Demux>, wrap: fn(Vec<u8>) -> StreamChunk)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => demux.dispatch(wrap(buf[..n].to_vec())),
            Err(e) => {
                debug!(error = %e, "Interpreter stream closed with error");
                break;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    generation: u64,
    kill: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
    debug!(generation, code = ?code, "Interpreter process exited");
    exit_tx.send_replace(Some(ExitInfo { code }));
    lifecycle.send_if_modified(|state| match state {
        Lifecycle::Ready { generation: current, .. } if *current == generation => {
            *state = Lifecycle::Stopped;
            true
        }
        _ => false,
    });
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGINT) {
        warn!(pid, error = %e, "Failed to interrupt interpreter");
    }
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) {
    warn!(pid, "Interrupting the interpreter is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_routes_to_registered_request_only() {
        let demux = Arc::new(Demux::default());
        demux.dispatch(StreamChunk::Stdout(b"orphan".to_vec()));

        let (guard, mut rx) = demux.register();
        demux.dispatch(StreamChunk::Stdout(b"mine".to_vec()));
        match rx.try_recv() {
            Ok(StreamChunk::Stdout(bytes)) => assert_eq!(bytes, b"mine"),
            other => panic!("unexpected chunk: {:?}", other),
        }

        drop(guard);
        demux.dispatch(StreamChunk::Stderr(b"late".to_vec()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_guard_does_not_detach_newer_route() {
        let demux = Arc::new(Demux::default());
        let (old_guard, _old_rx) = demux.register();
        let (_new_guard, mut new_rx) = demux.register();
        drop(old_guard);

        demux.dispatch(StreamChunk::Stdout(b"x".to_vec()));
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn lifecycle_ready_predicate() {
        assert!(Lifecycle::Ready {
            generation: 1,
            pid: Some(7)
        }
        .is_ready());
        assert!(!Lifecycle::Starting.is_ready());
        assert!(!Lifecycle::Failed("boom".into()).is_ready());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reset_aborts_a_start_that_never_becomes_ready() {
        use crate::resolver::{MockEnvironmentProvisioner, MockExecutableProbe};
        use crate::workspace::FsWorkspace;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let stall = dir.path().join("stall.sh");
        std::fs::write(&stall, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&stall, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut probe = MockExecutableProbe::new();
        probe.expect_probe().return_const(true);
        let mut provisioner = MockEnvironmentProvisioner::new();
        provisioner.expect_create().never();
        let resolver = ExecutableResolver::with_collaborators(
            vec![stall.to_string_lossy().into_owned()],
            None,
            Arc::new(probe),
            Arc::new(provisioner),
        );
        let config = SessionConfig::new(dir.path().join(".pyrepl"))
            .with_startup_timeout(Duration::from_secs(20));
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(config),
            Arc::new(resolver),
            Arc::new(FsWorkspace),
        ));

        let starting = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.ensure_started().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.lifecycle(), Lifecycle::Starting);

        tokio::time::timeout(Duration::from_secs(2), supervisor.reset())
            .await
            .expect("reset waited for the startup deadline");
        assert_eq!(supervisor.lifecycle(), Lifecycle::Stopped);

        let outcome = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(Error::InterpreterExited { .. })));
    }
}
