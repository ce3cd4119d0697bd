//! Session state and the controller that runs one task end to end

use crate::agent::{AgentLoop, LoopPhase, NoopObserver, TurnObserver};
use crate::config::{AgentConfig, Budget};
use serde::{Deserialize, Serialize};
use shellcraft_core::{
    convert_windows_paths, ContextStore, LlmProvider, Result, ShellExecutor, Task, Turn, Usage,
    UsageTracker,
};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Where a session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Iteration cap or session time limit reached without completion
    BudgetExhausted,
    /// Model service unreachable or refusing after retries
    ModelUnavailable,
    /// Too many consecutive malformed replies
    MalformedReplies,
    /// The shell could not be started
    ExecutorUnavailable,
    /// Too many consecutive commands hit the time limit
    RepeatedTimeouts,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::BudgetExhausted => "budget exhausted",
            FailureKind::ModelUnavailable => "model unavailable",
            FailureKind::MalformedReplies => "malformed replies",
            FailureKind::ExecutorUnavailable => "executor unavailable",
            FailureKind::RepeatedTimeouts => "repeated timeouts",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Option<String>),
    Failed(Failure),
    Aborted,
}

/// Everything a finished session leaves behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub id: String,
    pub task: Task,
    pub state: SessionState,
    pub failure: Option<Failure>,
    /// Completion text for completed sessions, otherwise the terminal condition
    pub summary: String,
    pub turns: Vec<Turn>,
    pub iterations: usize,
    pub model_calls: usize,
    pub usage: Usage,
    pub duration_ms: u64,
}

impl SessionResult {
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            shellcraft_core::error::serialization_error(e.to_string())
                .with_operation("SessionResult::to_json")
                .set_source(e)
        })
    }
}

/// One run of the agent loop against a single task.
///
/// Owns its context store and executor; nothing is shared across sessions.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    store: ContextStore,
    executor: ShellExecutor,
    budget: Budget,
    state: SessionState,
    phase: LoopPhase,
    outcome: Option<Outcome>,
    usage: UsageTracker,
    iterations: usize,
    malformed_streak: usize,
    timeout_streak: usize,
    started: Instant,
}

impl Session {
    pub fn new(store: ContextStore, executor: ShellExecutor, budget: Budget) -> Self {
        Self {
            id: Uuid::now_v7(),
            store,
            executor,
            budget,
            state: SessionState::Running,
            phase: LoopPhase::AwaitingModel,
            outcome: None,
            usage: UsageTracker::new(),
            iterations: 0,
            malformed_streak: 0,
            timeout_streak: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &Task {
        self.store.task()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn turns(&self) -> &[Turn] {
        self.store.turns()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub(crate) fn store(&self) -> &ContextStore {
        &self.store
    }

    pub(crate) fn executor(&self) -> &ShellExecutor {
        &self.executor
    }

    pub(crate) fn set_phase(&mut self, phase: LoopPhase) {
        self.phase = phase;
    }

    /// Start the next iteration and return its turn sequence number
    pub(crate) fn begin_iteration(&mut self) -> u64 {
        self.iterations += 1;
        self.iterations as u64
    }

    pub(crate) fn track_usage(&mut self, usage: &Usage) {
        self.usage.track(usage);
    }

    pub(crate) fn append(&mut self, turn: Turn) -> &Turn {
        self.store.append(turn)
    }

    /// Count a malformed reply; returns the current streak
    pub(crate) fn note_malformed(&mut self, malformed: bool) -> usize {
        self.malformed_streak = if malformed { self.malformed_streak + 1 } else { 0 };
        self.malformed_streak
    }

    /// Count a timed-out command; returns the current streak
    pub(crate) fn note_timeout(&mut self, timed_out: bool) -> usize {
        self.timeout_streak = if timed_out { self.timeout_streak + 1 } else { 0 };
        self.timeout_streak
    }

    /// `None` when there is no session limit, or it is too large to represent
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.budget
            .session_timeout
            .and_then(|t| self.started.checked_add(t))
    }

    pub(crate) fn finish(&mut self, outcome: Outcome) {
        debug_assert!(!self.state.is_terminal(), "session finished twice");
        self.state = match &outcome {
            Outcome::Completed(_) => SessionState::Completed,
            Outcome::Failed(_) => SessionState::Failed,
            Outcome::Aborted => SessionState::Aborted,
        };
        self.outcome = Some(outcome);
    }

    pub fn into_result(self) -> SessionResult {
        let turns_len = self.store.turns().len();
        let (failure, summary) = match self.outcome {
            Some(Outcome::Completed(summary)) => (
                None,
                summary.unwrap_or_else(|| format!("completed after {} turn(s)", turns_len)),
            ),
            Some(Outcome::Failed(failure)) => {
                let summary = failure.to_string();
                (Some(failure), summary)
            }
            Some(Outcome::Aborted) => (None, format!("aborted after {} turn(s)", turns_len)),
            None => (None, "still running".to_string()),
        };

        let task = self.store.task().clone();
        SessionResult {
            id: self.id.to_string(),
            task,
            state: self.state,
            failure,
            summary,
            iterations: self.iterations,
            model_calls: self.usage.total_calls,
            usage: self.usage.total(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            turns: self.store.into_turns(),
        }
    }
}

/// Runs sessions against one provider and configuration
pub struct SessionController<P: LlmProvider> {
    provider: P,
    config: AgentConfig,
}

impl<P: LlmProvider> SessionController<P> {
    pub fn new(provider: P, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { provider, config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Run `task` to a terminal state with the given limits.
    ///
    /// Only configuration problems are returned as `Err`; every other
    /// outcome, failures included, is a `SessionResult`.
    pub async fn run(
        &self,
        task: impl Into<String>,
        max_iterations: usize,
        per_command_timeout: Duration,
    ) -> Result<SessionResult> {
        let budget = Budget {
            max_iterations,
            command_timeout: per_command_timeout,
            session_timeout: self.config.session_timeout,
        };
        self.run_with(task, budget, &CancellationToken::new(), &mut NoopObserver)
            .await
    }

    /// Run with the configured limits until done or `cancel` fires
    pub async fn run_until_cancelled<O: TurnObserver>(
        &self,
        task: impl Into<String>,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<SessionResult> {
        self.run_with(task, self.config.budget(), cancel, observer).await
    }

    pub async fn run_with<O: TurnObserver>(
        &self,
        task: impl Into<String>,
        budget: Budget,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<SessionResult> {
        budget.validate()?;

        let mut text: String = task.into();
        if self.config.posix_paths {
            text = convert_windows_paths(&text).into_owned();
        }

        let store = ContextStore::new(Task::new(text), self.config.context.clone())?;
        let executor = ShellExecutor::new(self.config.shell.clone());
        let mut session = Session::new(store, executor, budget);

        let model = self
            .config
            .model
            .as_deref()
            .unwrap_or(self.provider.default_model())
            .to_string();
        let span = info_span!("session", id = %session.id(), model = %model);

        async {
            info!(max_iterations = budget.max_iterations, "session started");
            AgentLoop::new(&self.provider, &self.config, cancel)
                .run(&mut session, &mut *observer)
                .await;
            info!(
                state = %session.state(),
                turns = session.turns().len(),
                iterations = session.iterations(),
                "session finished"
            );
        }
        .instrument(span)
        .await;

        Ok(session.into_result())
    }
}
