//! # Context Store
//!
//! Holds the task and the turn history of one session, and renders the
//! size-bounded prompt sent to the model on every call.
//!
//! ## Budget policy
//!
//! Size is measured in characters of message content.
//!
//! 1. On `append`, a turn's reply, stdout and stderr are capped together at
//!    `max_output_chars`. Short parts stay whole, long ones share the rest
//!    (head and tail kept, middle elided).
//! 2. On `render`, the preamble and task always go first. Turns follow
//!    oldest-first; if they do not all fit, whole turns are dropped from the
//!    oldest end and a one-line omission note takes their place when it fits.
//! 3. The most recent turn is always rendered. If it alone exceeds what is
//!    left of the budget it is truncated further, never omitted.
//!
//! `ContextStore::new` refuses a task that leaves less than
//! [`MIN_TURN_RESERVE`] characters for turns, which keeps the rendered size
//! under budget for every turn sequence.

use crate::error::{self, Result};
use crate::preamble::SYSTEM_PREAMBLE;
use crate::provider::ChatMessage;
use crate::turn::{Task, Turn};

/// Default rendered prompt budget, in characters
pub const DEFAULT_BUDGET_CHARS: usize = 24_000;

/// Default cap for a stored turn (reply, stdout and stderr combined)
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 4_000;

/// Budget that must remain for turns after preamble and task
pub const MIN_TURN_RESERVE: usize = 256;

/// Context window settings
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Upper bound for the rendered prompt, in characters
    pub budget_chars: usize,
    /// Per-turn cap applied before storage
    pub max_output_chars: usize,
    /// System preamble (agent role and reply format)
    pub preamble: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_chars: DEFAULT_BUDGET_CHARS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            preamble: SYSTEM_PREAMBLE.to_string(),
        }
    }
}

/// A rendered context window
#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    /// How many of the oldest turns did not fit
    pub omitted_turns: usize,
}

impl Prompt {
    /// Size in characters of all message content
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| char_len(&m.content)).sum()
    }
}

/// Ordered, size-bounded history of one session
#[derive(Debug)]
pub struct ContextStore {
    config: ContextConfig,
    task: Task,
    head: Vec<ChatMessage>,
    head_len: usize,
    turns: Vec<Turn>,
}

impl ContextStore {
    pub fn new(task: Task, config: ContextConfig) -> Result<Self> {
        if config.max_output_chars == 0 {
            return Err(error::config_invalid("max_output_chars must be greater than zero"));
        }

        let head = vec![
            ChatMessage::system(config.preamble.clone()),
            ChatMessage::user(format!("Task:\n{}", task)),
        ];
        let head_len: usize = head.iter().map(|m| char_len(&m.content)).sum();
        let required = head_len + MIN_TURN_RESERVE;

        if required > config.budget_chars {
            return Err(error::config_invalid(
                "context budget too small for the preamble and task",
            )
            .with_operation("context::new")
            .with_context("budget_chars", config.budget_chars.to_string())
            .with_context("required", required.to_string()));
        }

        Ok(Self {
            config,
            task,
            head,
            head_len,
            turns: Vec::new(),
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Store a turn, capping its reply and output first
    pub fn append(&mut self, turn: Turn) -> &Turn {
        debug_assert!(
            self.turns.last().map_or(true, |last| last.seq() < turn.seq()),
            "turn sequence numbers must increase"
        );
        self.turns.push(turn.capped(self.config.max_output_chars));
        &self.turns[self.turns.len() - 1]
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    /// Render the prompt for the next model call
    pub fn render(&self) -> Prompt {
        let mut messages = self.head.clone();
        let Some((latest, older)) = self.turns.split_last() else {
            return Prompt {
                messages,
                omitted_turns: 0,
            };
        };

        let remaining = self.config.budget_chars.saturating_sub(self.head_len);
        let mut latest = RenderedTurn::from_turn(latest);

        if latest.len() > remaining {
            latest.shrink_to(remaining);
            messages.extend(latest.into_messages());
            return Prompt {
                messages,
                omitted_turns: older.len(),
            };
        }

        let rendered: Vec<RenderedTurn> = older.iter().map(RenderedTurn::from_turn).collect();
        let total: usize = rendered.iter().map(RenderedTurn::len).sum::<usize>() + latest.len();

        if total <= remaining {
            for turn in rendered {
                messages.extend(turn.into_messages());
            }
            messages.extend(latest.into_messages());
            return Prompt {
                messages,
                omitted_turns: 0,
            };
        }

        // Keep the longest suffix that fits next to a worst-case omission note.
        let reserve = char_len(&omission_note(older.len()));
        let mut used = latest.len();
        let mut start = rendered.len();
        while start > 0 && used + rendered[start - 1].len() + reserve <= remaining {
            start -= 1;
            used += rendered[start].len();
        }

        let note = omission_note(start);
        if used + char_len(&note) <= remaining {
            messages.push(ChatMessage::user(note));
        }
        for turn in rendered.into_iter().skip(start) {
            messages.extend(turn.into_messages());
        }
        messages.extend(latest.into_messages());

        Prompt {
            messages,
            omitted_turns: start,
        }
    }
}

/// A turn as it appears in the prompt: the reply, then what it caused
struct RenderedTurn {
    reply: String,
    observation: Option<String>,
}

impl RenderedTurn {
    fn from_turn(turn: &Turn) -> Self {
        Self {
            reply: turn.reply().to_string(),
            observation: observation(turn),
        }
    }

    fn len(&self) -> usize {
        char_len(&self.reply) + self.observation.as_deref().map_or(0, char_len)
    }

    /// Truncate so that `len() <= limit`. The observation gets at least half.
    fn shrink_to(&mut self, limit: usize) {
        match &mut self.observation {
            None => self.reply = truncate_middle(&self.reply, limit),
            Some(obs) => {
                let reply_share = char_len(&self.reply).min(limit / 2);
                *obs = truncate_middle(obs, limit - reply_share);
                let reply_allow = limit - char_len(obs);
                self.reply = truncate_middle(&self.reply, reply_allow);
            }
        }
    }

    fn into_messages(self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::assistant(self.reply)];
        if let Some(obs) = self.observation {
            messages.push(ChatMessage::user(obs));
        }
        messages
    }
}

/// What the model is told about the effect of its reply
fn observation(turn: &Turn) -> Option<String> {
    let mut out = String::new();
    if let Some(warning) = turn.warning() {
        out.push_str(&format!("Warning: {}.\n", warning));
    }

    match (turn.command(), turn.result()) {
        (Some(_), Some(result)) => {
            out.push_str(&format!(
                "<TOOL RES exit_code={} duration_ms={}>\n",
                result.exit_code(),
                result.duration().as_millis()
            ));
            if result.stdout().is_empty() && result.stderr().is_empty() {
                out.push_str("(no output)\n");
            }
            if !result.stdout().is_empty() {
                out.push_str(result.stdout());
                out.push('\n');
            }
            if !result.stderr().is_empty() {
                out.push_str("--stderr--\n");
                out.push_str(result.stderr());
                out.push('\n');
            }
            if result.is_timed_out() {
                out.push_str("(killed: exceeded the command time limit; output is partial)\n");
            }
            if result.is_interrupted() {
                out.push_str("(killed: interrupted by the user)\n");
            }
            out.push_str("</TOOL RES>");
        }
        (Some(_), None) => out.push_str("(the shell could not be started; nothing ran)"),
        (None, _) if turn.is_done() => {}
        (None, _) => out.push_str(
            "No command was run. Reply with exactly one <TOOL> block, or <DONE> if the task is complete.",
        ),
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn omission_note(count: usize) -> String {
    format!("[{} earlier turn(s) omitted to fit the context budget]", count)
}

fn elision_marker(count: usize) -> String {
    format!("\n... [{} chars elided] ...\n", count)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Shorten `text` to at most `max_chars` characters, keeping head and tail
/// around an elision marker. Falls back to a plain prefix when `max_chars`
/// is too small to hold the marker.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let len = char_len(text);
    if len <= max_chars {
        return text.to_string();
    }

    let marker_len = char_len(&elision_marker(len));
    if max_chars < marker_len + 2 {
        return text.chars().take(max_chars).collect();
    }

    let keep = max_chars - marker_len;
    let tail = keep / 2;
    let head = keep - tail;

    let mut out = String::with_capacity(max_chars * 4);
    out.extend(text.chars().take(head));
    out.push_str(&elision_marker(len - head - tail));
    out.extend(text.chars().skip(len - tail));
    out
}
