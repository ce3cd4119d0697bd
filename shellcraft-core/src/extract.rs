//! # Command extraction
//!
//! Turns a raw model reply into at most one shell command or a completion
//! signal. The reply format is tag based (case-insensitive):
//!
//! ```text
//! <THINK> reasoning, ignored </THINK>
//! <TOOL> ls -la </TOOL>
//! <RESULT> what the last command showed </RESULT>
//! <NOTE> message for the user </NOTE>
//! <DONE> optional summary </DONE>      also: <DONE/> or a bare <DONE>
//! ```
//!
//! `<RESULT>` and `<NOTE>` are for display only and never change the action.
//!
//! Every reply yields exactly one [`Action`]. Anything ambiguous is resolved
//! towards running less, and reported back through a [`ReplyWarning`].
//! Nothing here has side effects.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"))
}

fn tool_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<tool>(.*?)</tool>").expect("valid regex"))
}

fn tool_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<tool>").expect("valid regex"))
}

fn result_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<result>(.*?)</result>").expect("valid regex"))
}

fn note_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<note>(.*?)</note>").expect("valid regex"))
}

fn done_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<done\s*/>|<done>(?:(.*?)</done>)?").expect("valid regex")
    })
}

fn code_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?```\z").expect("valid regex")
    })
}

/// What the loop should do with a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run this command
    Command(String),
    /// The model declares the task complete
    Done(Option<String>),
    /// Neither: conversational progress or a malformed reply
    Nothing,
}

/// Something off about a reply, fed back to the model on the next call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyWarning {
    /// More than one `<TOOL>` opening; only the first usable command was run
    MultipleCommands { count: usize },
    /// `<TOOL>` and `<DONE>` in one reply; the command ran, completion ignored
    DoneWithCommand,
    /// `<TOOL>` without a closing tag
    UnterminatedBlock,
    /// `<TOOL></TOOL>` with nothing inside
    EmptyCommand,
}

impl ReplyWarning {
    /// Whether the reply broke the format (as opposed to merely being ambiguous)
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ReplyWarning::DoneWithCommand)
    }
}

impl fmt::Display for ReplyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyWarning::MultipleCommands { count } => write!(
                f,
                "reply contained {} <TOOL> blocks; only the first command was executed. Send one command per reply",
                count
            ),
            ReplyWarning::DoneWithCommand => write!(
                f,
                "reply contained both <TOOL> and <DONE>; the command was executed and <DONE> ignored. Confirm completion after checking the result"
            ),
            ReplyWarning::UnterminatedBlock => {
                write!(f, "reply opened <TOOL> without a closing </TOOL>; nothing was executed")
            }
            ReplyWarning::EmptyCommand => {
                write!(f, "reply contained an empty <TOOL></TOOL> block; nothing was executed")
            }
        }
    }
}

/// Result of parsing one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub action: Action,
    pub warning: Option<ReplyWarning>,
    /// First `<RESULT>` section, trimmed
    pub result: Option<String>,
    /// First `<NOTE>` section, trimmed
    pub note: Option<String>,
}

impl Extraction {
    pub fn command(&self) -> Option<&str> {
        match &self.action {
            Action::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.action, Action::Done(_))
    }

    pub fn is_malformed(&self) -> bool {
        self.warning.as_ref().is_some_and(ReplyWarning::is_malformed)
    }
}

/// Parse a model reply.
pub fn extract(reply: &str) -> Extraction {
    let visible = think_block().replace_all(reply, "");

    let blocks: Vec<&str> = tool_block()
        .captures_iter(&visible)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let opened = tool_open().find_iter(&visible).count();

    let command = blocks
        .iter()
        .map(|body| unfence(body))
        .find(|cmd| !cmd.is_empty());

    let done = done_marker().captures(&visible).map(|c| {
        c.get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    });

    let (action, warning) = match command {
        Some(cmd) if opened > 1 => (Action::Command(cmd), Some(ReplyWarning::MultipleCommands { count: opened })),
        Some(cmd) => (Action::Command(cmd), done.map(|_| ReplyWarning::DoneWithCommand)),
        None => {
            let warning = if opened > blocks.len() {
                Some(ReplyWarning::UnterminatedBlock)
            } else if !blocks.is_empty() {
                Some(ReplyWarning::EmptyCommand)
            } else {
                None
            };
            let action = match (done, &warning) {
                (Some(summary), None) => Action::Done(summary),
                _ => Action::Nothing,
            };
            (action, warning)
        }
    };

    Extraction {
        action,
        warning,
        result: first_section(result_block(), &visible),
        note: first_section(note_block(), &visible),
    }
}

fn first_section(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strip a markdown fence some models put inside the tag
fn unfence(body: &str) -> String {
    let trimmed = body.trim();
    match code_fence().captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_command() {
        let ex = extract("<THINK>list things</THINK>\n<TOOL>ls -la</TOOL>");
        assert_eq!(ex.action, Action::Command("ls -la".into()));
        assert!(ex.warning.is_none());
    }

    #[test]
    fn test_command_keeps_pipes_and_newlines() {
        let ex = extract("<tool>\nfind . -name '*.rs' | wc -l\necho ok > out.txt\n</tool>");
        assert_eq!(
            ex.command(),
            Some("find . -name '*.rs' | wc -l\necho ok > out.txt")
        );
    }

    #[test]
    fn test_two_blocks_takes_first_and_flags() {
        let ex = extract("<TOOL>mv a b</TOOL>\n<TOOL>rm -rf b</TOOL>");
        assert_eq!(ex.command(), Some("mv a b"));
        assert_eq!(ex.warning, Some(ReplyWarning::MultipleCommands { count: 2 }));
        assert!(ex.is_malformed());
    }

    #[test]
    fn test_no_blocks_is_nothing() {
        let ex = extract("Which directory do you mean?");
        assert_eq!(ex.action, Action::Nothing);
        assert!(ex.warning.is_none());
        assert!(!ex.is_malformed());
    }

    #[test]
    fn test_done_variants() {
        assert_eq!(extract("<DONE/>").action, Action::Done(None));
        assert_eq!(extract("all good <done>").action, Action::Done(None));
        assert_eq!(
            extract("<DONE>Renamed 3 files</DONE>").action,
            Action::Done(Some("Renamed 3 files".into()))
        );
    }

    #[test]
    fn test_done_with_command_runs_command() {
        let ex = extract("<TOOL>rm tmp.txt</TOOL><DONE>removed</DONE>");
        assert_eq!(ex.command(), Some("rm tmp.txt"));
        assert_eq!(ex.warning, Some(ReplyWarning::DoneWithCommand));
        assert!(!ex.is_done());
        assert!(!ex.is_malformed());
    }

    #[test]
    fn test_unterminated_block() {
        let ex = extract("<TOOL>ls -la");
        assert_eq!(ex.action, Action::Nothing);
        assert_eq!(ex.warning, Some(ReplyWarning::UnterminatedBlock));
        assert!(ex.is_malformed());
    }

    #[test]
    fn test_empty_block() {
        let ex = extract("<TOOL>   </TOOL>");
        assert_eq!(ex.action, Action::Nothing);
        assert_eq!(ex.warning, Some(ReplyWarning::EmptyCommand));
    }

    #[test]
    fn test_broken_block_blocks_done() {
        let ex = extract("<TOOL></TOOL><DONE/>");
        assert_eq!(ex.action, Action::Nothing);
        assert_eq!(ex.warning, Some(ReplyWarning::EmptyCommand));
    }

    #[test]
    fn test_tags_inside_think_are_ignored() {
        let ex = extract("<THINK>maybe <TOOL>rm -rf /</TOOL>? no.</THINK><TOOL>pwd</TOOL>");
        assert_eq!(ex.command(), Some("pwd"));
        assert!(ex.warning.is_none());
    }

    #[test]
    fn test_fenced_command_inside_tag() {
        let ex = extract("<TOOL>\n```bash\ngit status\n```\n</TOOL>");
        assert_eq!(ex.command(), Some("git status"));
    }

    #[test]
    fn test_unterminated_second_block_flags() {
        let ex = extract("<TOOL>ls</TOOL>\n<TOOL>rm -rf build");
        assert_eq!(ex.command(), Some("ls"));
        assert_eq!(ex.warning, Some(ReplyWarning::MultipleCommands { count: 2 }));
        assert!(ex.is_malformed());
    }

    #[test]
    fn test_empty_first_block_flags() {
        let ex = extract("<TOOL></TOOL><TOOL>rm x</TOOL>");
        assert_eq!(ex.command(), Some("rm x"));
        assert_eq!(ex.warning, Some(ReplyWarning::MultipleCommands { count: 2 }));
    }

    #[test]
    fn test_result_and_note_sections() {
        let ex = extract(
            "<THINK>check</THINK><TOOL>echo 123</TOOL>\n<RESULT> ok </RESULT>\n<note>新建文件夹 renamed</note>",
        );
        assert_eq!(ex.command(), Some("echo 123"));
        assert_eq!(ex.result.as_deref(), Some("ok"));
        assert_eq!(ex.note.as_deref(), Some("新建文件夹 renamed"));
        assert!(ex.warning.is_none());

        let plain = extract("<TOOL>pwd</TOOL><NOTE>  </NOTE>");
        assert!(plain.result.is_none());
        assert!(plain.note.is_none());
    }

    #[test]
    fn test_warning_messages_mention_tags() {
        let msg = ReplyWarning::MultipleCommands { count: 3 }.to_string();
        assert!(msg.contains("3 <TOOL> blocks"));
        assert!(ReplyWarning::UnterminatedBlock.to_string().contains("</TOOL>"));
    }
}
