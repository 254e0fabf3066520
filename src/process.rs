use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Largest single line a [`LineScanner`] accepts. JSONL events from some
/// agents carry whole diffs on one line.
pub const MAX_LINE_BYTES: usize = 100 * 1024 * 1024;

const INITIAL_BUFFER_BYTES: usize = 64 * 1024;

/// How long to wait for the stderr reader after the child has been reaped.
/// A surviving grandchild can hold the pipe open.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for spawning an agent child process.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    /// Files owned by this execution, removed once it closes.
    pub temp_files: Vec<PathBuf>,
    pub log_prefix: String,
}

/// Final state of a child, captured exactly once on close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stderr: String,
}

struct Running {
    child: Child,
    stderr_task: JoinHandle<String>,
    stdin_task: Option<JoinHandle<()>>,
    kill_task: JoinHandle<()>,
}

/// Handle to a running agent process.
///
/// The child is placed in its own process group on Unix. Cancelling the
/// token passed to [`spawn`] sends SIGKILL to the whole group. [`close`]
/// waits for the child and captures its exit code and stderr once; later
/// calls return the same [`ExitInfo`].
///
/// Drop the stdout reader before closing: a child blocked on a full pipe
/// only exits once its reader is gone.
///
/// [`close`]: ExecutionHandle::close
pub struct ExecutionHandle {
    stdout: Option<ChildStdout>,
    running: Mutex<Option<Running>>,
    exit: OnceCell<ExitInfo>,
    cancel: CancellationToken,
    pgid: Option<i32>,
    temp_files: Vec<PathBuf>,
    log_prefix: String,
}

/// Spawn `config` into a new process group, wired to `cancel`.
pub fn spawn(config: SpawnConfig, cancel: CancellationToken) -> Result<ExecutionHandle> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(if config.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            remove_temp_files(&config.temp_files);
            return Err(Error::Process(format!(
                "failed to spawn '{}': {e}",
                config.command
            )));
        }
    };

    let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let prefix = config.log_prefix.clone();
    let stderr_task = tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut buf = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut buf).await {
            debug!("[{prefix}] stderr read failed: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let stdin_task = match (config.stdin, child.stdin.take()) {
        (Some(data), Some(mut stdin)) => {
            let prefix = config.log_prefix.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    debug!("[{prefix}] stdin write failed: {e}");
                }
                // dropping stdin closes the pipe so the agent sees EOF
            }))
        }
        _ => None,
    };

    let kill_task = {
        let token = cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
        })
    };

    debug!(
        "[{}] spawned {} {:?} (pgid {:?})",
        config.log_prefix, config.command, config.args, pgid
    );

    Ok(ExecutionHandle {
        stdout,
        running: Mutex::new(Some(Running {
            child,
            stderr_task,
            stdin_task,
            kill_task,
        })),
        exit: OnceCell::new(),
        cancel,
        pgid,
        temp_files: config.temp_files,
        log_prefix: config.log_prefix,
    })
}

impl ExecutionHandle {
    /// Take ownership of the child's stdout. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take stdout wrapped in a [`LineScanner`] with the default line cap.
    pub fn scanner(&mut self) -> Option<LineScanner<BufReader<ChildStdout>>> {
        self.take_stdout()
            .map(|out| LineScanner::new(BufReader::with_capacity(INITIAL_BUFFER_BYTES, out)))
    }

    /// Wait for the child to exit and capture its exit code and stderr.
    ///
    /// Idempotent: only the first call does any work.
    pub async fn close(&self) -> &ExitInfo {
        self.exit.get_or_init(|| self.finish()).await
    }

    /// Exit state, available once [`close`](Self::close) has completed.
    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit.get()
    }

    async fn finish(&self) -> ExitInfo {
        // The guard is held across the wait so that a caller abandoning
        // close() midway leaves the child in place for the next attempt.
        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return ExitInfo {
                exit_code: -1,
                signal: None,
                stderr: String::new(),
            };
        };

        if self.cancel.is_cancelled() {
            if let Some(pgid) = self.pgid {
                kill_process_group(pgid);
            }
            let _ = running.child.start_kill();
        }

        let (exit_code, signal) = match running.child.wait().await {
            Ok(status) => extract_exit_info(&status),
            Err(e) => {
                warn!("[{}] wait failed: {e}", self.log_prefix);
                (-1, None)
            }
        };
        running.kill_task.abort();
        if let Some(ref task) = running.stdin_task {
            task.abort();
        }

        let drained = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut running.stderr_task).await;
        let stderr = match drained {
            Ok(Ok(stderr)) => stderr,
            Ok(Err(e)) => {
                debug!("[{}] stderr reader failed: {e}", self.log_prefix);
                String::new()
            }
            Err(_) => {
                debug!("[{}] stderr still open after exit", self.log_prefix);
                running.stderr_task.abort();
                String::new()
            }
        };
        guard.take();

        remove_temp_files(&self.temp_files);

        debug!(
            "[{}] exited with code {exit_code} (signal {signal:?})",
            self.log_prefix
        );

        ExitInfo {
            exit_code,
            signal,
            stderr,
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.exit.get().is_none() {
            // never closed: take the group down with us, kill_on_drop handles the leader
            if let Some(pgid) = self.pgid {
                kill_process_group(pgid);
            }
            if let Ok(mut guard) = self.running.try_lock()
                && let Some(running) = guard.take()
            {
                running.kill_task.abort();
                running.stderr_task.abort();
            }
        }
        remove_temp_files(&self.temp_files);
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// Without process groups only the direct child is killed, via
/// `kill_on_drop`/`start_kill`; its descendants may outlive it.
#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

fn remove_temp_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", path.display()),
        }
    }
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

/// Reads newline-terminated lines with a hard per-line cap.
pub struct LineScanner<R> {
    reader: R,
    buf: Vec<u8>,
    max_line: usize,
    line_number: usize,
}

impl<R: AsyncBufRead + Unpin> LineScanner<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, MAX_LINE_BYTES)
    }

    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(INITIAL_BUFFER_BYTES.min(max_line + 1)),
            max_line,
            line_number: 0,
        }
    }

    /// 1-based number of the last line returned.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Next line without its terminator, or `None` at end of stream.
    ///
    /// A line longer than the cap is an `InvalidData` error.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let limit = (self.max_line as u64).saturating_add(2);
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        if self.buf.len() > self.max_line {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds maximum length of {} bytes", self.max_line),
            ));
        }

        self.line_number += 1;
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
