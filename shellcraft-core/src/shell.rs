//! # Shell Executor
//!
//! Runs one command string in a fresh shell process and captures what it
//! wrote. Each call is independent: no state carries over between commands
//! except through the filesystem.
//!
//! On Unix the shell is started in its own process group. Once the command
//! finishes, times out or is cancelled, the whole group gets `SIGKILL`, so
//! nothing the command started (background jobs included) outlives it.

use crate::error::{self, Error, Result};
use crate::turn::{CommandResult, KILLED_EXIT_CODE};
use futures_util::future::join;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Git Bash location on a default Windows install
pub const GIT_BASH_PATH: &str = r"C:\Program Files\Git\bin\bash.exe";

/// Default limit for bytes kept per stream
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// How long pipes may stay open after the shell itself has exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(150);

/// Which shell to start and how
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell binary
    pub program: PathBuf,
    /// Arguments placed before the command string
    pub args: Vec<String>,
    /// Working directory; inherits the caller's when `None`
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Bytes kept per stream; the rest is read and discarded
    pub max_capture_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        let program = if cfg!(windows) {
            PathBuf::from(GIT_BASH_PATH)
        } else {
            PathBuf::from("bash")
        };

        Self {
            program,
            args: vec!["-c".to_string()],
            working_dir: None,
            env: Vec::new(),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

impl ShellConfig {
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Runs commands in a fresh shell process each time
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    config: ShellConfig,
}

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Interrupted,
}

/// Bytes read from one stream, bounded by `limit`
struct Capture {
    bytes: Vec<u8>,
    dropped: usize,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            dropped: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{} more bytes not captured]", self.dropped));
        }
        text
    }
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Shell program name, for logs and error context
    pub fn program(&self) -> String {
        self.config.program.display().to_string()
    }

    /// Run `command` and wait for it, at most `limit` or until `cancel` fires.
    ///
    /// A non-zero exit is a normal result. Only a failure to start the shell
    /// is an `Err` (kind `SpawnFailed`).
    pub async fn execute(
        &self,
        command: &str,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        if command.trim().is_empty() {
            return Err(error::invalid_argument("command is empty").with_operation("shell::execute"));
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(command = %command, timeout_ms = limit.as_millis() as u64, "spawning shell");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            error::spawn_failed(self.program(), e.to_string())
                .with_operation("shell::execute")
                .set_source(e)
        })?;
        let pid = child.id();

        let mut out = Capture::new(self.config.max_capture_bytes);
        let mut err = Capture::new(self.config.max_capture_bytes);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // A limit too large to represent means no limit.
        let deadline = started.checked_add(limit);

        let outcome = {
            let drains = join(drain(stdout, &mut out), drain(stderr, &mut err));
            tokio::pin!(drains);
            let mut drained = false;

            let outcome = loop {
                tokio::select! {
                    _ = &mut drains, if !drained => drained = true,
                    status = child.wait() => break match status {
                        Ok(status) => Outcome::Exited(status),
                        Err(e) => Outcome::WaitFailed(e),
                    },
                    _ = sleep_until(deadline) => break Outcome::TimedOut,
                    _ = cancel.cancelled() => break Outcome::Interrupted,
                }
            };

            // Output still in flight after a normal exit.
            if !drained && matches!(outcome, Outcome::Exited(_)) {
                drained = timeout(PIPE_DRAIN_GRACE, &mut drains).await.is_ok();
            }

            kill_group(pid);
            if !matches!(outcome, Outcome::Exited(_)) {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "start_kill failed");
                }
            }

            if !drained && timeout(PIPE_DRAIN_GRACE, &mut drains).await.is_err() {
                warn!(pid, "pipes still open after kill, abandoning remaining output");
            }
            outcome
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            // Reap the killed shell.
            let _ = timeout(PIPE_DRAIN_GRACE, child.wait()).await;
        }

        let elapsed = started.elapsed();
        let stdout = out.into_string();
        let stderr = err.into_string();

        let result = match outcome {
            Outcome::Exited(status) => CommandResult::exited(exit_code(status), stdout, stderr, elapsed),
            Outcome::TimedOut => {
                warn!(timeout_ms = limit.as_millis() as u64, "command timed out");
                CommandResult::timed_out(stdout, stderr, elapsed)
            }
            Outcome::Interrupted => CommandResult::interrupted(stdout, stderr, elapsed),
            Outcome::WaitFailed(e) => {
                return Err(Error::from(e)
                    .with_operation("shell::execute")
                    .with_context("shell", self.program()));
            }
        };

        debug!(
            exit_code = result.exit_code(),
            duration_ms = elapsed.as_millis() as u64,
            stdout_len = result.stdout().len(),
            stderr_len = result.stderr().len(),
            "command finished"
        );
        Ok(result)
    }
}

/// Read a stream to EOF, keeping what fits in `capture`
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, capture: &mut Capture) {
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => capture.push(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    KILLED_EXIT_CODE
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => debug!(pid, %errno, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
