//! Worker process supervision.
//!
//! An [`ExtensionRuntime`] owns one worker process. It hands the worker one
//! end of a Unix socket pair (announced through the environment), keeps the
//! other end as a [`MessageChannel`], remembers the last stderr line, and
//! reports a classified [`ExitCause`] exactly once when the process ends.
//!
//! ```text
//! Running ──stop()──▶ Stopping ──exit──▶ Stopped
//!    │
//!    └──exit──▶ Exited | Terminated
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::collaborators::WorkerCache;
use super::error::{ExtensionError, ExtensionResult};
use super::exit::{classify_exit, ExitCause, ProcessExit};
use super::ipc::client::{ENV_EXTENSION_ID, ENV_SOCKET_FD};
use super::ipc::MessageChannel;
use super::ExtensionId;

/// Lines of stderr kept for exit classification.
pub const STDERR_TAIL_LINES: usize = 1;

/// How long to wait for stderr to drain after the process is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Callback receiving the classified exit.
pub type ExitHandler = Box<dyn FnOnce(ExitCause)>;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Stopping,
    Stopped,
    Exited,
    Terminated,
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub ext_id: ExtensionId,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Supervision settings.
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Delay between SIGTERM and SIGKILL.
    pub kill_delay: Duration,
    /// Notified after every exit so cached worker lists refresh.
    pub cache: Option<Rc<dyn WorkerCache>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            kill_delay: Duration::from_millis(550),
            cache: None,
        }
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("kill_delay", &self.kill_delay)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// Fixed-capacity buffer keeping the most recent items.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Handle to a supervised worker process. Clones share the same process.
#[derive(Clone)]
pub struct ExtensionRuntime {
    inner: Rc<RuntimeInner>,
}

struct RuntimeInner {
    ext_id: ExtensionId,
    pid: u32,
    started_at: Instant,
    kill_delay: Duration,
    channel: MessageChannel,
    state: Cell<RuntimeState>,
    stopped: Cell<bool>,
    exited: Cell<bool>,
    stderr_tail: Rc<RefCell<RingBuffer<String>>>,
}

impl ExtensionRuntime {
    /// Launch the worker. Returns as soon as the process is spawned.
    ///
    /// Must be called inside a `LocalSet`.
    pub fn spawn(
        spec: LaunchSpec,
        options: RuntimeOptions,
        on_exit: ExitHandler,
    ) -> ExtensionResult<Self> {
        let spawn_error = |message: String| ExtensionError::Spawn {
            extension: spec.ext_id.clone(),
            message,
        };

        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| spawn_error("empty command".to_string()))?;

        let (host_end, worker_end) = std::os::unix::net::UnixStream::pair()?;
        let channel = MessageChannel::from_unix(spec.ext_id.clone(), host_end)?;
        let worker_fd = worker_end.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .env(ENV_EXTENSION_ID, &spec.ext_id)
            .env(ENV_SOCKET_FD, worker_fd.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || inherit_fd(worker_fd));
        }

        let started_at = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                channel.close();
                return Err(spawn_error(format!("{}: {}", program, e)));
            }
        };
        drop(worker_end);

        let pid = child.id().unwrap_or_default();
        tracing::info!("Started extension '{}' (pid {})", spec.ext_id, pid);

        let stderr_tail = Rc::new(RefCell::new(RingBuffer::new(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::task::spawn_local(monitor_stderr(
                spec.ext_id.clone(),
                stderr,
                Rc::clone(&stderr_tail),
            ))
        });
        if let Some(stdout) = child.stdout.take() {
            tokio::task::spawn_local(forward_stdout(spec.ext_id.clone(), stdout));
        }

        let inner = Rc::new(RuntimeInner {
            ext_id: spec.ext_id,
            pid,
            started_at,
            kill_delay: options.kill_delay,
            channel,
            state: Cell::new(RuntimeState::Running),
            stopped: Cell::new(false),
            exited: Cell::new(false),
            stderr_tail,
        });

        let monitored = Rc::clone(&inner);
        tokio::task::spawn_local(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit::from(status),
                Err(e) => {
                    tracing::error!("Failed to wait for extension '{}': {}", monitored.ext_id, e);
                    ProcessExit::default()
                }
            };
            monitored.exited.set(true);
            let uptime = monitored.started_at.elapsed();

            if let Some(task) = stderr_task {
                if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
                    tracing::debug!("stderr of '{}' still open after exit", monitored.ext_id);
                }
            }

            monitored.finish(exit, uptime, options.cache, on_exit);
        });

        Ok(Self { inner })
    }

    pub fn ext_id(&self) -> &str {
        &self.inner.ext_id
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.inner.channel
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state.get()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Whether the process has not been reaped yet.
    pub fn is_running(&self) -> bool {
        !self.inner.exited.get()
    }

    /// Most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.inner.stderr_tail.borrow().to_vec()
    }

    /// Ask the worker to exit, escalating to SIGKILL after the kill delay.
    ///
    /// No-op once the process has exited or a stop is already under way.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.exited.get() {
            tracing::debug!("Extension '{}' already exited, nothing to stop", inner.ext_id);
            return;
        }
        if inner.stopped.replace(true) {
            return;
        }

        tracing::info!("Stopping extension '{}' (pid {})", inner.ext_id, inner.pid);
        inner.state.set(RuntimeState::Stopping);
        inner.channel.close();
        send_signal(&inner.ext_id, inner.pid, libc::SIGTERM);

        let pending = Rc::clone(inner);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(pending.kill_delay).await;
            if pending.kill() {
                tracing::warn!(
                    "Extension '{}' ignored SIGTERM, killed after {:?}",
                    pending.ext_id,
                    pending.kill_delay
                );
            }
        });
    }

    /// Send SIGKILL if the process is still alive. Returns whether a signal was sent.
    pub fn kill(&self) -> bool {
        self.inner.kill()
    }
}

impl RuntimeInner {
    fn kill(&self) -> bool {
        if self.exited.get() {
            return false;
        }
        send_signal(&self.ext_id, self.pid, libc::SIGKILL);
        true
    }

    fn finish(
        &self,
        exit: ProcessExit,
        uptime: Duration,
        cache: Option<Rc<dyn WorkerCache>>,
        on_exit: ExitHandler,
    ) {
        let stderr = self.stderr_tail.borrow().to_vec().join("\n");
        let cause = classify_exit(&self.ext_id, self.stopped.get(), uptime, exit, &stderr);

        self.state.set(match cause {
            ExitCause::Stopped => RuntimeState::Stopped,
            ExitCause::Terminated { .. } => RuntimeState::Terminated,
            _ => RuntimeState::Exited,
        });

        if cause.is_error() {
            tracing::warn!(
                "Extension '{}' {} ({}): {}",
                self.ext_id,
                cause.kind(),
                exit,
                cause
            );
        } else {
            tracing::info!("Extension '{}' stopped", self.ext_id);
        }

        self.channel.close();
        if let Some(cache) = cache {
            cache.invalidate_worker_set();
        }
        on_exit(cause);
    }
}

impl fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRuntime")
            .field("ext_id", &self.inner.ext_id)
            .field("pid", &self.inner.pid)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

/// Clear close-on-exec on the worker's socket in the forked child.
fn inherit_fd(fd: i32) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; async-signal-safe.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn send_signal(ext_id: &str, pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("Failed to signal extension '{}' ({}): {}", ext_id, signal, err);
        }
    }
}

async fn monitor_stderr<R>(ext_id: ExtensionId, stderr: R, tail: Rc<RefCell<RingBuffer<String>>>)
where
    R: AsyncRead + Unpin,
{
    for_each_line(&ext_id, "stderr", stderr, |line| {
        tracing::debug!(target: "nova_extensions::worker", "[{}] {}", ext_id, line);
        tail.borrow_mut().push(line);
    })
    .await;
}

/// Drain stdout to EOF so the worker never writes into a closed pipe.
async fn forward_stdout<R>(ext_id: ExtensionId, stdout: R)
where
    R: AsyncRead + Unpin,
{
    for_each_line(&ext_id, "stdout", stdout, |line| {
        tracing::debug!(target: "nova_extensions::worker", "[{}] {}", ext_id, line);
    })
    .await;
}

/// Read `stream` until EOF, decoding each line lossily.
async fn for_each_line<R, F>(ext_id: &str, name: &str, stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => on_line(decode_line(&buf)),
            Err(e) => {
                tracing::debug!("{} of '{}' unreadable: {}", name, ext_id, e);
                break;
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let mut ring = RingBuffer::new(1);
        assert!(ring.is_empty());
        ring.push("first".to_string());
        ring.push("second".to_string());
        assert_eq!(ring.to_vec(), vec!["second".to_string()]);

        let mut ring = RingBuffer::new(2);
        for n in 1..=3 {
            ring.push(n);
        }
        assert_eq!(ring.to_vec(), vec![2, 3]);
    }

    #[test]
    fn test_decode_line_is_lossy() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xffbad\n"), "\u{FFFD}bad");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        assert_eq!(ring.to_vec(), vec![1]);
    }

    #[test]
    fn test_default_options() {
        let options = RuntimeOptions::default();
        assert_eq!(options.kill_delay, Duration::from_millis(550));
        assert!(options.cache.is_none());
    }
}
