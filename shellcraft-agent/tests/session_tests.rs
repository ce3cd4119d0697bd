#![cfg(unix)]

use shellcraft_agent::{
    AgentConfig, Budget, FailureKind, LoopPhase, SessionController, SessionState, TurnObserver,
};
use shellcraft_core::{
    ChatMessage, CompletionRequest, CompletionResponse, ContextConfig, ErrorKind, Extraction, FinishReason,
    LlmProvider, ProviderError, ReplyWarning, ShellConfig, StreamChunk, StreamReceiver, Turn, Usage,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Replays canned replies in order and records every prompt it was sent
struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn replies(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }

    fn prompt_text(&self, index: usize) -> String {
        self.prompts()[index]
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.prompts.lock().unwrap().push(request.messages.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Nothing left to say.".to_string()));

        next.map(|content| CompletionResponse {
            id: "scripted".into(),
            model: "scripted-model".into(),
            content: Some(content),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

fn config(dir: &Path) -> AgentConfig {
    AgentConfig {
        shell: ShellConfig::default()
            .with_program("/bin/sh")
            .with_working_dir(dir),
        model_retry_delay: Duration::from_millis(10),
        ..AgentConfig::default()
    }
}

fn controller(provider: ScriptedProvider, config: AgentConfig) -> SessionController<ScriptedProvider> {
    SessionController::new(provider, config).unwrap()
}

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_list_then_done() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>ls -la</TOOL>", "<DONE>Listed the directory</DONE>"]),
        config(dir.path()),
    );

    let result = ctl.run("list all files in the current directory", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.turns.len(), 2);
    assert_eq!(result.summary, "Listed the directory");
    assert_eq!(result.turns[0].command(), Some("ls -la"));
    let first = result.turns[0].result().unwrap();
    assert_eq!(first.exit_code(), 0);
    assert!(first.stdout().contains("notes.txt"));
    assert!(result.turns[1].is_done());

    // The second call sees the first command's output.
    let second_prompt = ctl.provider().prompt_text(1);
    assert!(second_prompt.contains("exit_code=0"));
    assert!(second_prompt.contains("notes.txt"));
    assert_eq!(result.usage.total_tokens, 30);
    assert_eq!(result.model_calls, 2);
}

#[tokio::test]
async fn test_failed_command_is_data() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&[
            "<TOOL>rm nonexistent.txt</TOOL>",
            "<THINK>it does not exist, create it first</THINK><TOOL>touch nonexistent.txt; rm nonexistent.txt</TOOL>",
            "<DONE/>",
        ]),
        config(dir.path()),
    );

    let result = ctl.run("delete nonexistent.txt", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.turns.len(), 3);
    let first = result.turns[0].result().unwrap();
    assert_ne!(first.exit_code(), 0);
    assert!(!first.stderr().is_empty());
    assert_eq!(result.turns[1].result().map(|r| r.exit_code()), Some(0));
    assert!(ctl.provider().prompt_text(1).contains("--stderr--"));
    assert!(!dir.path().join("nonexistent.txt").exists());
}

#[tokio::test]
async fn test_iteration_budget_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["Let me think.", "Still thinking.", "Hmm.", "<DONE/>"]),
        config(dir.path()),
    );

    let result = ctl.run("do something", 3, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Failed);
    assert_eq!(result.failure_kind(), Some(FailureKind::BudgetExhausted));
    assert_eq!(result.turns.len(), 3);
    assert!(result.turns.iter().all(|t| t.command().is_none()));
    assert_eq!(result.iterations, 3);
}

#[tokio::test]
async fn test_malformed_replies_fail_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        max_malformed_replies: 2,
        ..config(dir.path())
    };
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>ls", "<TOOL></TOOL>", "<TOOL>pwd", "<DONE/>"]),
        config,
    );

    let result = ctl.run("list", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.failure_kind(), Some(FailureKind::MalformedReplies));
    assert_eq!(result.turns.len(), 3);
    assert_eq!(result.turns[0].warning(), Some(&ReplyWarning::UnterminatedBlock));
    assert_eq!(result.turns[1].warning(), Some(&ReplyWarning::EmptyCommand));
    assert!(ctl.provider().prompt_text(1).contains("Warning:"));
}

#[tokio::test]
async fn test_timeout_then_proceed() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>sleep 5</TOOL>", "<DONE>gave up on sleeping</DONE>"]),
        config(dir.path()),
    );

    let started = std::time::Instant::now();
    let result = ctl.run("wait a bit", 10, Duration::from_millis(200)).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.turns[0].result().unwrap().is_timed_out());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(ctl.provider().prompt_text(1).contains("exceeded the command time limit"));
}

#[tokio::test]
async fn test_repeated_timeouts_fail_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        max_consecutive_timeouts: 1,
        ..config(dir.path())
    };
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>sleep 5</TOOL>", "<TOOL>sleep 5</TOOL>", "<DONE/>"]),
        config,
    );

    let result = ctl.run("wait", 10, Duration::from_millis(100)).await.unwrap();

    assert_eq!(result.failure_kind(), Some(FailureKind::RepeatedTimeouts));
    assert_eq!(result.turns.len(), 2);
}

#[tokio::test]
async fn test_background_job_returns_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>sleep 30 & echo started</TOOL>", "<DONE/>"]),
        config(dir.path()),
    );

    let started = std::time::Instant::now();
    let result = ctl.run("start a job", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.turns[0].result().unwrap().stdout().contains("started"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_multiple_commands_runs_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>echo one</TOOL>\n<TOOL>echo two</TOOL>", "<DONE/>"]),
        config(dir.path()),
    );

    let result = ctl.run("echo", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    let first = &result.turns[0];
    assert_eq!(first.result().unwrap().stdout(), "one\n");
    assert_eq!(first.warning(), Some(&ReplyWarning::MultipleCommands { count: 2 }));
}

#[tokio::test]
async fn test_missing_shell_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.shell = ShellConfig::default().with_program("/nonexistent/bash");
    let ctl = controller(ScriptedProvider::replies(&["<TOOL>ls</TOOL>", "<DONE/>"]), config);

    let result = ctl.run("list", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Failed);
    assert_eq!(result.failure_kind(), Some(FailureKind::ExecutorUnavailable));
    assert_eq!(result.turns.len(), 1);
    assert_eq!(result.turns[0].command(), Some("ls"));
    assert!(result.turns[0].result().is_none());
}

#[tokio::test]
async fn test_auth_error_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::new(vec![Err(ProviderError::AuthenticationFailed), Ok("<DONE/>".into())]),
        config(dir.path()),
    );

    let result = ctl.run("list", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.failure_kind(), Some(FailureKind::ModelUnavailable));
    assert!(result.turns.is_empty());
    assert_eq!(ctl.provider().prompts().len(), 1);
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::new(vec![
            Err(ProviderError::Network("connection reset".into())),
            Ok("<DONE>done</DONE>".into()),
        ]),
        config(dir.path()),
    );

    let result = ctl.run("list", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.iterations, 1);
    assert_eq!(ctl.provider().prompts().len(), 2);
}

#[tokio::test]
async fn test_retries_run_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        model_retries: 1,
        ..config(dir.path())
    };
    let ctl = controller(
        ScriptedProvider::new(vec![
            Err(ProviderError::RateLimited { retry_after: None }),
            Err(ProviderError::RateLimited { retry_after: None }),
            Ok("<DONE/>".into()),
        ]),
        config,
    );

    let result = ctl.run("list", 10, TIMEOUT).await.unwrap();

    assert_eq!(result.failure_kind(), Some(FailureKind::ModelUnavailable));
    assert!(result.failure.unwrap().message.contains("persistent"));
    assert_eq!(ctl.provider().prompts().len(), 2);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(ScriptedProvider::replies(&["<TOOL>ls</TOOL>"]), config(dir.path()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = ctl
        .run_until_cancelled("list", &cancel, &mut shellcraft_agent::NoopObserver)
        .await
        .unwrap();

    assert_eq!(result.state, SessionState::Aborted);
    assert!(result.turns.is_empty());
    assert!(ctl.provider().prompts().is_empty());
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>echo begin; sleep 10</TOOL>", "<DONE/>"]),
        config(dir.path()),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = ctl
        .run_until_cancelled("wait", &cancel, &mut shellcraft_agent::NoopObserver)
        .await
        .unwrap();

    assert_eq!(result.state, SessionState::Aborted);
    assert_eq!(result.turns.len(), 1);
    let interrupted = result.turns[0].result().unwrap();
    assert!(interrupted.is_interrupted());
    assert!(interrupted.stdout().contains("begin"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_session_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>sleep 10</TOOL>", "<DONE/>"]),
        config(dir.path()),
    );
    let budget = Budget {
        max_iterations: 10,
        command_timeout: TIMEOUT,
        session_timeout: Some(Duration::from_millis(300)),
    };

    let result = ctl
        .run_with("wait", budget, &CancellationToken::new(), &mut shellcraft_agent::NoopObserver)
        .await
        .unwrap();

    assert_eq!(result.failure_kind(), Some(FailureKind::BudgetExhausted));
    assert!(result.turns[0].result().unwrap().is_timed_out());
    assert_eq!(result.turns.len(), 1);
}

#[derive(Default)]
struct Recorder {
    phases: Vec<LoopPhase>,
    commands: Vec<String>,
    turns: Vec<u64>,
    chunks: usize,
    restarts: usize,
    reply: String,
    /// (reply, result, note) per parsed reply
    replies: Vec<(String, Option<String>, Option<String>)>,
}

impl TurnObserver for Recorder {
    fn on_phase(&mut self, phase: LoopPhase) {
        self.phases.push(phase);
    }

    fn on_reply_chunk(&mut self, chunk: &str) {
        self.chunks += 1;
        self.reply.push_str(chunk);
    }

    fn on_reply_restart(&mut self) {
        self.restarts += 1;
        self.reply.clear();
    }

    fn on_reply(&mut self, reply: &str, extraction: &Extraction) {
        self.replies
            .push((reply.to_string(), extraction.result.clone(), extraction.note.clone()));
    }

    fn on_turn(&mut self, turn: &Turn) {
        self.turns.push(turn.seq());
    }

    fn on_command(&mut self, command: &str) {
        self.commands.push(command.to_string());
    }
}

#[tokio::test]
async fn test_observer_sees_progress() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>pwd</TOOL>", "<DONE/>"]),
        config(dir.path()),
    );
    let mut recorder = Recorder::default();

    let result = ctl
        .run_until_cancelled("where am I", &CancellationToken::new(), &mut recorder)
        .await
        .unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(recorder.commands, vec!["pwd".to_string()]);
    assert_eq!(recorder.turns, vec![1, 2]);
    assert_eq!(recorder.chunks, 2);
    assert_eq!(
        recorder.phases,
        vec![
            LoopPhase::AwaitingModel,
            LoopPhase::HaveCommand,
            LoopPhase::Executing,
            LoopPhase::AwaitingModel,
        ]
    );
}

#[tokio::test]
async fn test_whole_replies_reach_observer_without_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        stream: false,
        ..config(dir.path())
    };
    let ctl = controller(
        ScriptedProvider::replies(&[
            "<NOTE>checking the dir</NOTE><TOOL>ls</TOOL>",
            "<RESULT>it is empty</RESULT><DONE/>",
        ]),
        config,
    );
    let mut recorder = Recorder::default();

    let result = ctl
        .run_until_cancelled("is it empty", &CancellationToken::new(), &mut recorder)
        .await
        .unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(recorder.chunks, 0);
    assert_eq!(
        recorder.replies,
        vec![
            (
                "<NOTE>checking the dir</NOTE><TOOL>ls</TOOL>".to_string(),
                None,
                Some("checking the dir".to_string()),
            ),
            (
                "<RESULT>it is empty</RESULT><DONE/>".to_string(),
                Some("it is empty".to_string()),
                None,
            ),
        ]
    );
}

#[tokio::test]
async fn test_windows_paths_in_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        posix_paths: true,
        ..config(dir.path())
    };
    let ctl = controller(ScriptedProvider::replies(&["<DONE/>"]), config);

    let result = ctl.run(r"list C:\Users\me\Desktop", 5, TIMEOUT).await.unwrap();

    assert_eq!(result.task.as_str(), "list /c/Users/me/Desktop");
    assert!(ctl.provider().prompt_text(0).contains("/c/Users/me/Desktop"));
}

#[tokio::test]
async fn test_task_too_large_for_context() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        context: ContextConfig {
            budget_chars: 500,
            ..ContextConfig::default()
        },
        ..config(dir.path())
    };
    let ctl = controller(ScriptedProvider::replies(&["<DONE/>"]), config);

    let err = ctl.run("list", 5, TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[tokio::test]
async fn test_transcript_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(
        ScriptedProvider::replies(&["<TOOL>echo hi</TOOL>", "<DONE>said hi</DONE>"]),
        config(dir.path()),
    );

    let result = ctl.run("say hi", 5, TIMEOUT).await.unwrap();
    let json = result.to_json().unwrap();
    let back: shellcraft_agent::SessionResult = serde_json::from_str(&json).unwrap();

    assert_eq!(back.id, result.id);
    assert_eq!(back.turns, result.turns);
    assert_eq!(back.state, SessionState::Completed);
}

#[tokio::test]
async fn test_huge_timeouts_mean_no_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        session_timeout: Some(Duration::from_secs(u64::MAX)),
        ..config(dir.path())
    };
    let ctl = controller(ScriptedProvider::replies(&["<TOOL>echo hi</TOOL>", "<DONE/>"]), config);

    let result = ctl.run("t", 5, Duration::from_secs(u64::MAX)).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.turns[0].result().map(|r| r.stdout()), Some("hi\n"));
}

/// Streams a reply that breaks off halfway on the first call
struct BrokenStreamProvider {
    calls: Mutex<usize>,
}

impl LlmProvider for BrokenStreamProvider {
    fn name(&self) -> &str {
        "broken-stream"
    }

    fn default_model(&self) -> &str {
        "broken-stream-model"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse {
            id: "s".into(),
            model: "broken-stream-model".into(),
            content: Some("<DONE>finished</DONE>".into()),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamReceiver, ProviderError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls == 1
        };
        if first {
            let chunks = vec![
                StreamChunk::Text("<DONE>fin".into()),
                StreamChunk::Error("connection reset".into()),
            ];
            return Ok(StreamReceiver::new("broken-stream-model", futures_util::stream::iter(chunks)));
        }
        Ok(StreamReceiver::from_response(self.complete(request).await?))
    }
}

#[tokio::test]
async fn test_retried_stream_restarts_reply() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = SessionController::new(BrokenStreamProvider { calls: Mutex::new(0) }, config(dir.path())).unwrap();
    let mut recorder = Recorder::default();

    let result = ctl
        .run_until_cancelled("finish", &CancellationToken::new(), &mut recorder)
        .await
        .unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.summary, "finished");
    assert_eq!(recorder.restarts, 1);
    assert_eq!(recorder.chunks, 2);
    assert_eq!(recorder.reply, "<DONE>finished</DONE>");
    assert_eq!(result.turns[0].reply(), "<DONE>finished</DONE>");
}
