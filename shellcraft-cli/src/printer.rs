//! Terminal progress output

use shellcraft_agent::{LoopPhase, TurnObserver};
use shellcraft_core::{Extraction, Turn};
use std::io::Write;

/// Lines of command output shown per stream unless verbose
const PREVIEW_LINES: usize = 20;

/// Prints replies, commands and results as a session runs
pub struct ProgressPrinter {
    verbose: bool,
    quiet: bool,
    /// A streamed reply is open on the current line
    mid_reply: bool,
    /// Chunks of the current reply were already printed
    streamed: bool,
}

impl ProgressPrinter {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self {
            verbose,
            quiet,
            mid_reply: false,
            streamed: false,
        }
    }

    fn end_reply(&mut self) {
        if self.mid_reply {
            println!();
            self.mid_reply = false;
        }
    }

    fn print_stream(&self, label: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if !label.is_empty() {
            println!("   {}", label);
        }
        for line in preview(text, self.verbose) {
            println!("   | {}", line);
        }
    }
}

impl TurnObserver for ProgressPrinter {
    fn on_phase(&mut self, phase: LoopPhase) {
        if self.verbose && phase == LoopPhase::AwaitingModel {
            self.end_reply();
            println!("... waiting for the model");
        }
    }

    fn on_reply_chunk(&mut self, chunk: &str) {
        if self.quiet {
            return;
        }
        print!("{}", chunk);
        let _ = std::io::stdout().flush();
        self.mid_reply = true;
        self.streamed = true;
    }

    fn on_reply_restart(&mut self) {
        if self.mid_reply && !self.quiet {
            println!();
            println!("[reply interrupted, retrying]");
        }
        self.mid_reply = false;
        self.streamed = false;
    }

    fn on_reply(&mut self, reply: &str, extraction: &Extraction) {
        self.end_reply();
        let streamed = std::mem::take(&mut self.streamed);
        if self.quiet {
            return;
        }
        for line in reply_lines(reply, extraction, streamed) {
            println!("{}", line);
        }
    }

    fn on_command(&mut self, command: &str) {
        self.end_reply();
        if !self.quiet {
            println!("\n$ {}", command);
        }
    }

    fn on_turn(&mut self, turn: &Turn) {
        self.end_reply();
        if self.quiet {
            return;
        }

        if let Some(w) = turn.warning() {
            println!("warning: {}", w);
        }

        match (turn.command(), turn.result()) {
            (Some(_), Some(result)) => {
                let status = if result.is_timed_out() {
                    "timed out".to_string()
                } else if result.is_interrupted() {
                    "interrupted".to_string()
                } else {
                    format!("exit {}", result.exit_code())
                };
                println!("[{}] {}ms", status, result.duration().as_millis());
                self.print_stream("", result.stdout());
                self.print_stream("stderr:", result.stderr());
            }
            (Some(_), None) => println!("[not run]"),
            _ => {}
        }
    }
}

/// Lines to show once a reply is complete. A reply that was not streamed is
/// printed whole; RESULT and NOTE sections are always called out.
fn reply_lines(reply: &str, extraction: &Extraction, streamed: bool) -> Vec<String> {
    let mut lines = Vec::new();
    if !streamed && !reply.trim().is_empty() {
        lines.extend(reply.trim_end().lines().map(str::to_string));
    }
    if let Some(result) = &extraction.result {
        lines.push(format!("result: {}", result));
    }
    if let Some(note) = &extraction.note {
        lines.push(format!("note: {}", note));
    }
    lines
}

/// Output lines to show. Long output keeps its head and tail.
fn preview(text: &str, verbose: bool) -> Vec<String> {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    if verbose || lines.len() <= PREVIEW_LINES {
        return lines.into_iter().map(str::to_string).collect();
    }

    let half = PREVIEW_LINES / 2;
    let mut shown: Vec<String> = lines[..half].iter().map(|l| l.to_string()).collect();
    shown.push(format!("... ({} more lines)", lines.len() - PREVIEW_LINES));
    shown.extend(lines[lines.len() - half..].iter().map(|l| l.to_string()));
    shown
}
