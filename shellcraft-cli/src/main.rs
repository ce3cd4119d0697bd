//! # Shellcraft CLI
//!
//! Hands a task to the model and lets it drive a shell until it reports done.
//!
//! Usage:
//!   shellcraft <task>
//!   shellcraft run <task>
//!   shellcraft config
//!   shellcraft preamble
//!
//! Examples:
//!   shellcraft "List the files in this directory"
//!   shellcraft -n 5 -t 10 "Find the largest file under src/"
//!   shellcraft --transcript run.json "Create notes.txt and write today's date in it"
//!   shellcraft -f src/main.py "Why does this script crash on empty input?"
//!
//! Exit codes: 0 completed, 1 failed, 2 budget exhausted, 130 aborted.

mod attach;
mod config;
mod printer;

use clap::{Parser, Subcommand};
use config::ShellcraftConfig;
use printer::ProgressPrinter;
use shellcraft_agent::{FailureKind, SessionController, SessionResult, SessionState};
use shellcraft_core::{Error, OpenAIProvider, Result, SYSTEM_PREAMBLE};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shellcraft")]
#[command(author, version, about = "Shellcraft - let a model drive your shell to finish a task")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Task to carry out (when not using subcommands)
    #[arg(trailing_var_arg = true)]
    task: Vec<String>,

    /// JSON config file (default: $SHELLCRAFT_CONFIG or ./.shellcraft.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Attach a file to the task (repeatable)
    #[arg(short, long = "file", global = true, value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Model name
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    /// Model calls allowed before giving up
    #[arg(short = 'n', long, global = true)]
    max_iterations: Option<usize>,

    /// Time limit for each command
    #[arg(short, long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Time limit for the whole session
    #[arg(long, global = true, value_name = "SECS")]
    session_timeout: Option<u64>,

    /// Shell binary to run commands with
    #[arg(long, global = true, value_name = "PATH")]
    shell: Option<PathBuf>,

    /// Directory commands start in
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Prompt budget in characters
    #[arg(long, global = true, value_name = "CHARS")]
    budget: Option<usize>,

    /// Rewrite Windows paths in the task (C:\x -> /c/x)
    #[arg(long, global = true)]
    posix_paths: bool,

    /// Wait for whole replies instead of streaming them
    #[arg(long, global = true)]
    no_stream: bool,

    /// Write the session as JSON to this file
    #[arg(long, global = true, value_name = "FILE")]
    transcript: Option<PathBuf>,

    /// Show full command output, loop phases and debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show the final status
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task
    Run {
        /// The task description
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Print the effective configuration (API key hidden)
    Config,
    /// Print the system preamble sent to the model
    Preamble,
}

impl Cli {
    /// Flags are the last layer, over file and environment
    fn apply_to(&self, config: &mut ShellcraftConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(n) = self.max_iterations {
            config.max_iterations = n;
        }
        if let Some(secs) = self.timeout {
            config.command_timeout_secs = secs;
        }
        if let Some(secs) = self.session_timeout {
            config.session_timeout_secs = Some(secs);
        }
        if let Some(shell) = &self.shell {
            config.shell = Some(shell.clone());
        }
        if let Some(dir) = &self.cwd {
            config.working_dir = Some(dir.clone());
        }
        if let Some(chars) = self.budget {
            config.context_budget_chars = chars;
        }
        if self.posix_paths {
            config.posix_paths = true;
        }
        if self.no_stream {
            config.stream = false;
        }
    }

    fn load_config(&self) -> Result<ShellcraftConfig> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = ShellcraftConfig::load(self.config.as_deref(), lookup)?;
        config.apply_env(lookup)?;
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,shellcraft_core=debug,shellcraft_agent=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn exit_code(result: &SessionResult) -> i32 {
    match result.state {
        SessionState::Completed => 0,
        SessionState::Aborted => 130,
        SessionState::Failed if result.failure_kind() == Some(FailureKind::BudgetExhausted) => 2,
        SessionState::Failed | SessionState::Running => 1,
    }
}

fn print_summary(result: &SessionResult, quiet: bool) {
    if quiet {
        match result.state {
            SessionState::Completed => println!("{}", result.summary),
            _ => eprintln!("{}: {}", result.state, result.summary),
        }
        return;
    }

    let banner = match result.state {
        SessionState::Completed => "=== TASK COMPLETE ===",
        SessionState::Failed => "=== TASK FAILED ===",
        SessionState::Aborted => "=== ABORTED ===",
        SessionState::Running => "=== STOPPED ===",
    };
    println!("\n{}\n", banner);
    println!("{}", result.summary);
    println!(
        "\n{} turn(s), {} model call(s), {:.1}s",
        result.turns.len(),
        result.model_calls,
        result.duration_ms as f64 / 1000.0
    );
    println!(
        "Tokens: {} prompt + {} completion = {} total",
        result.usage.prompt_tokens, result.usage.completion_tokens, result.usage.total_tokens
    );
}

async fn run_task(cli: &Cli, ask: &str) -> Result<i32> {
    let config = cli.load_config()?;
    let task = attach::compose_task(&cli.files, ask)?;

    if config.api_key.is_none() {
        tracing::warn!("no API key configured; requests go out unauthenticated");
    }
    let provider = OpenAIProvider::new(config.provider_config()).map_err(Error::from)?;
    let controller = SessionController::new(provider, config.agent_config())?;

    if !cli.quiet {
        println!("Task: {}", ask);
        for path in &cli.files {
            println!("Attached: {}", path.display());
        }
        println!("Model: {} @ {}\n", config.model, config.base_url);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping the session...");
            on_interrupt.cancel();
        }
    });

    let mut printer = ProgressPrinter::new(cli.verbose, cli.quiet);
    let result = controller.run_until_cancelled(&task, &cancel, &mut printer).await?;

    print_summary(&result, cli.quiet);

    if let Some(path) = &cli.transcript {
        let json = result.to_json()?;
        std::fs::write(path, json).map_err(|e| {
            Error::from(e)
                .with_operation("cli::write_transcript")
                .with_context("path", path.display().to_string())
        })?;
        if !cli.quiet {
            println!("Transcript written to {}", path.display());
        }
    }

    Ok(exit_code(&result))
}

fn show_config(cli: &Cli) -> Result<i32> {
    let config = cli.load_config()?.redacted();
    let json = serde_json::to_string_pretty(&config).map_err(|e| {
        shellcraft_core::error::serialization_error(e.to_string())
            .with_operation("cli::show_config")
            .set_source(e)
    })?;
    println!("{}", json);
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match &cli.command {
        Some(Commands::Preamble) => {
            println!("{}", SYSTEM_PREAMBLE);
            Ok(0)
        }
        Some(Commands::Config) => show_config(&cli),
        Some(Commands::Run { task }) => run_task(&cli, &task.join(" ")).await,
        None => {
            if cli.task.is_empty() {
                eprintln!("Usage: shellcraft <task>");
                eprintln!("       shellcraft run <task>");
                eprintln!("       shellcraft config");
                eprintln!("       shellcraft preamble");
                eprintln!("\nRun 'shellcraft --help' for more options.");
                std::process::exit(1);
            }
            run_task(&cli, &cli.task.join(" ")).await
        }
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellcraft_agent::Failure;
    use shellcraft_core::{Task, Usage};

    fn result(state: SessionState, failure: Option<Failure>) -> SessionResult {
        SessionResult {
            id: "s".into(),
            task: Task::new("t"),
            state,
            failure,
            summary: String::new(),
            turns: Vec::new(),
            iterations: 1,
            model_calls: 1,
            usage: Usage::default(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&result(SessionState::Completed, None)), 0);
        assert_eq!(exit_code(&result(SessionState::Aborted, None)), 130);

        let budget = Failure::new(FailureKind::BudgetExhausted, "no completion after 3 iteration(s)");
        assert_eq!(exit_code(&result(SessionState::Failed, Some(budget))), 2);

        let model = Failure::new(FailureKind::ModelUnavailable, "down");
        assert_eq!(exit_code(&result(SessionState::Failed, Some(model))), 1);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "shellcraft",
            "-n",
            "4",
            "--timeout",
            "9",
            "--no-stream",
            "--posix-paths",
            "list",
            "files",
        ]);
        let mut config = ShellcraftConfig::default();
        cli.apply_to(&mut config);

        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.command_timeout_secs, 9);
        assert!(!config.stream);
        assert!(config.posix_paths);
        assert_eq!(cli.task.join(" "), "list files");
    }

    #[test]
    fn test_run_subcommand_parses() {
        let cli = Cli::parse_from(["shellcraft", "run", "-m", "gpt-4o", "say", "hi"]);
        match cli.command {
            Some(Commands::Run { task }) => assert_eq!(task.join(" "), "say hi"),
            _ => panic!("expected run subcommand"),
        }
        assert_eq!(cli.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_file_flag_repeats() {
        let cli = Cli::parse_from(["shellcraft", "-f", "a.txt", "--file", "b.txt", "explain", "these"]);
        assert_eq!(cli.files, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert_eq!(cli.task.join(" "), "explain these");
    }
}
