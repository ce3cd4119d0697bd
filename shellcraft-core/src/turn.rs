//! # Session history records
//!
//! A session is an append-only list of [`Turn`]s recorded against one
//! immutable [`Task`]. Each turn owns at most one [`CommandResult`].

use crate::context::truncate_middle;
use crate::extract::ReplyWarning;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exit code reported when a command was killed before it could exit
pub const KILLED_EXIT_CODE: i32 = -1;

/// The user's natural-language goal. Fixed once a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(String);

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one shell command.
///
/// Fields are private: a result is never mutated after the executor builds
/// it, and capping produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration_ms: u64,
    timed_out: bool,
    interrupted: bool,
}

impl CommandResult {
    /// A command that ran to completion (with any exit code)
    pub fn exited(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            timed_out: false,
            interrupted: false,
        }
    }

    /// A command killed after exceeding its timeout; output is partial
    pub fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::exited(KILLED_EXIT_CODE, stdout, stderr, duration)
        }
    }

    /// A command killed because the session was cancelled
    pub fn interrupted(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            interrupted: true,
            ..Self::exited(KILLED_EXIT_CODE, stdout, stderr, duration)
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }

    /// Copy with stdout and stderr together capped at `max_chars`
    pub fn capped(&self, max_chars: usize) -> Self {
        let [stdout_max, stderr_max] =
            fair_shares([char_len(&self.stdout), char_len(&self.stderr)], max_chars);
        Self {
            stdout: truncate_middle(&self.stdout, stdout_max),
            stderr: truncate_middle(&self.stderr, stderr_max),
            ..self.clone()
        }
    }

    fn output_len(&self) -> usize {
        char_len(&self.stdout) + char_len(&self.stderr)
    }
}

/// One loop iteration: the model reply and whatever it caused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    seq: u64,
    reply: String,
    command: Option<String>,
    result: Option<CommandResult>,
    warning: Option<ReplyWarning>,
    done: bool,
}

impl Turn {
    /// A turn where the reply produced no command (yet)
    pub fn new(seq: u64, reply: impl Into<String>) -> Self {
        Self {
            seq,
            reply: reply.into(),
            command: None,
            result: None,
            warning: None,
            done: false,
        }
    }

    /// Record the command taken from the reply. `result` is `None` only when
    /// the shell could not be started.
    pub fn with_command(mut self, command: impl Into<String>, result: Option<CommandResult>) -> Self {
        self.command = Some(command.into());
        self.result = result;
        self
    }

    pub fn with_warning(mut self, warning: Option<ReplyWarning>) -> Self {
        self.warning = warning;
        self
    }

    /// Mark the turn that carried the completion marker
    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn result(&self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    pub fn warning(&self) -> Option<&ReplyWarning> {
        self.warning.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Copy with reply and captured output together capped at `max_chars`
    pub(crate) fn capped(self, max_chars: usize) -> Self {
        let output_len = self.result.as_ref().map_or(0, CommandResult::output_len);
        let [reply_max, output_max] = fair_shares([char_len(&self.reply), output_len], max_chars);
        Self {
            reply: truncate_middle(&self.reply, reply_max),
            result: self.result.map(|r| r.capped(output_max)),
            ..self
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `total` across parts of the given lengths. Parts that fit an even
/// share are kept whole; the others split what is left. Shares never sum
/// past `total`.
fn fair_shares<const N: usize>(lens: [usize; N], total: usize) -> [usize; N] {
    let mut shares = [0; N];
    let mut open: Vec<usize> = (0..N).collect();
    let mut left = total;

    while !open.is_empty() {
        let even = left / open.len();
        let (fits, rest): (Vec<usize>, Vec<usize>) = open.into_iter().partition(|&i| lens[i] <= even);
        if fits.is_empty() {
            let extra = left % rest.len();
            for (k, &i) in rest.iter().enumerate() {
                shares[i] = even + usize::from(k < extra);
            }
            break;
        }
        for &i in &fits {
            shares[i] = lens[i];
            left -= lens[i];
        }
        open = rest;
    }
    shares
}
