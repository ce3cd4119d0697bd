//! Agent loop - drives one session from task to terminal state
//!
//! Each cycle renders the context, asks the model for the next step, pulls a
//! command out of the reply, runs it and records the turn:
//!
//! ```text
//! AwaitingModel -> HaveCommand -> Executing -> AwaitingModel
//!       |                                          |
//!       +------> Completed | Failed | Aborted <----+
//! ```
//!
//! A failing command is data for the next model call, never a reason to stop.

use crate::config::AgentConfig;
use crate::session::{Failure, FailureKind, Outcome, Session};
use shellcraft_core::{
    extract, Action, CompletionRequest, CompletionResponse, Error, Extraction, LlmProvider, Prompt,
    ReplyWarning, Turn,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Position inside a running cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingModel,
    HaveCommand,
    Executing,
}

/// Receives progress while a session runs. All methods default to no-ops.
pub trait TurnObserver {
    fn on_phase(&mut self, _phase: LoopPhase) {}

    /// A piece of the model reply, as it streams in
    fn on_reply_chunk(&mut self, _chunk: &str) {}

    /// The model call is being retried; chunks seen so far are void
    fn on_reply_restart(&mut self) {}

    /// The whole reply arrived and was parsed. Called whether or not it streamed.
    fn on_reply(&mut self, _reply: &str, _extraction: &Extraction) {}

    /// About to run `command`
    fn on_command(&mut self, _command: &str) {}

    /// A turn was appended to the history
    fn on_turn(&mut self, _turn: &Turn) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl TurnObserver for NoopObserver {}

enum ModelError {
    Cancelled,
    DeadlineReached,
    Failed(Error),
}

/// One pass over a session. Borrowed state only; the session owns the rest.
pub struct AgentLoop<'a, P: LlmProvider> {
    provider: &'a P,
    config: &'a AgentConfig,
    cancel: &'a CancellationToken,
}

impl<'a, P: LlmProvider> AgentLoop<'a, P> {
    pub fn new(provider: &'a P, config: &'a AgentConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            provider,
            config,
            cancel,
        }
    }

    /// Run cycles until the session reaches a terminal state
    pub async fn run<O: TurnObserver>(&self, session: &mut Session, observer: &mut O) {
        loop {
            if let Some(outcome) = self.check_limits(session) {
                session.finish(outcome);
                return;
            }
            if let Some(outcome) = self.run_cycle(session, observer).await {
                session.finish(outcome);
                return;
            }
        }
    }

    fn check_limits(&self, session: &Session) -> Option<Outcome> {
        if self.cancel.is_cancelled() {
            info!("session cancelled");
            return Some(Outcome::Aborted);
        }

        let max = session.budget().max_iterations;
        if session.iterations() >= max {
            warn!(max_iterations = max, "iteration budget exhausted");
            return Some(Outcome::Failed(Failure::new(
                FailureKind::BudgetExhausted,
                format!("no completion after {} iteration(s)", max),
            )));
        }

        if session.deadline().is_some_and(|d| Instant::now() >= d) {
            warn!("session time limit reached");
            return Some(session_timeout_failure(session));
        }

        None
    }

    async fn run_cycle<O: TurnObserver>(&self, session: &mut Session, observer: &mut O) -> Option<Outcome> {
        let seq = session.begin_iteration();
        self.enter(session, observer, LoopPhase::AwaitingModel);

        let prompt = session.store().render();
        debug!(
            iteration = seq,
            prompt_chars = prompt.char_len(),
            omitted_turns = prompt.omitted_turns,
            "calling model"
        );

        let reply = match self.call_model(session, prompt, observer).await {
            Ok(reply) => reply,
            Err(ModelError::Cancelled) => return Some(Outcome::Aborted),
            Err(ModelError::DeadlineReached) => return Some(session_timeout_failure(session)),
            Err(ModelError::Failed(err)) => {
                warn!(error = %err, "model call failed");
                return Some(Outcome::Failed(Failure::new(FailureKind::ModelUnavailable, err.to_string())));
            }
        };

        let extraction = extract(&reply);
        observer.on_reply(&reply, &extraction);
        let malformed = extraction.is_malformed();
        let warning = extraction.warning.clone();
        if let Some(w) = &warning {
            debug!(warning = %w, "reply warning");
        }

        match extraction.action {
            Action::Done(summary) => {
                session.note_malformed(false);
                self.record(session, observer, Turn::new(seq, reply).with_done());
                info!(iteration = seq, "task reported complete");
                Some(Outcome::Completed(summary))
            }
            Action::Nothing => {
                self.record(session, observer, Turn::new(seq, reply).with_warning(warning));
                let streak = session.note_malformed(malformed);
                if streak > self.config.max_malformed_replies {
                    return Some(Outcome::Failed(Failure::new(
                        FailureKind::MalformedReplies,
                        format!("{} malformed replies in a row", streak),
                    )));
                }
                None
            }
            Action::Command(command) => {
                // A command ran, so the reply was usable even with a warning.
                session.note_malformed(false);
                self.execute(session, observer, seq, reply, command, warning).await
            }
        }
    }

    async fn execute<O: TurnObserver>(
        &self,
        session: &mut Session,
        observer: &mut O,
        seq: u64,
        reply: String,
        command: String,
        warning: Option<ReplyWarning>,
    ) -> Option<Outcome> {
        self.enter(session, observer, LoopPhase::HaveCommand);
        observer.on_command(&command);
        self.enter(session, observer, LoopPhase::Executing);

        // Never let a single command outlive the session deadline.
        let mut limit = session.budget().command_timeout;
        if let Some(deadline) = session.deadline() {
            limit = limit.min(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)));
        }

        let executed = session.executor().execute(&command, limit, self.cancel).await;
        let turn = Turn::new(seq, reply).with_warning(warning);

        match executed {
            Ok(result) => {
                let timed_out = result.is_timed_out();
                let interrupted = result.is_interrupted();
                debug!(
                    exit_code = result.exit_code(),
                    timed_out,
                    duration_ms = result.duration().as_millis() as u64,
                    "command executed"
                );
                self.record(session, observer, turn.with_command(command, Some(result)));

                if interrupted {
                    return Some(Outcome::Aborted);
                }
                let streak = session.note_timeout(timed_out);
                if streak > self.config.max_consecutive_timeouts {
                    return Some(Outcome::Failed(Failure::new(
                        FailureKind::RepeatedTimeouts,
                        format!("{} commands in a row exceeded the time limit", streak),
                    )));
                }
                None
            }
            Err(err) => {
                let err = err.with_operation("agent::execute");
                warn!(error = %err, "shell unavailable");
                self.record(session, observer, turn.with_command(command, None));
                Some(Outcome::Failed(Failure::new(FailureKind::ExecutorUnavailable, err.to_string())))
            }
        }
    }

    /// Ask the model for the next reply, retrying transient errors
    async fn call_model<O: TurnObserver>(
        &self,
        session: &mut Session,
        prompt: Prompt,
        observer: &mut O,
    ) -> Result<String, ModelError> {
        let deadline = session.deadline();
        let mut attempt: u32 = 0;

        loop {
            let request = self.build_request(&prompt);
            let result = tokio::select! {
                r = self.request(request, observer) => r,
                _ = self.cancel.cancelled() => return Err(ModelError::Cancelled),
                _ = sleep_until(deadline) => return Err(ModelError::DeadlineReached),
            };

            let err = match result {
                Ok(response) => {
                    session.track_usage(&response.usage);
                    return Ok(response.content.unwrap_or_default());
                }
                Err(err) => err
                    .with_operation("agent::call_model")
                    .with_context("attempt", (attempt + 1).to_string()),
            };

            if !err.is_retryable() {
                return Err(ModelError::Failed(err));
            }
            if attempt >= self.config.model_retries {
                return Err(ModelError::Failed(err.persist()));
            }

            attempt += 1;
            warn!(error = %err, attempt, "transient model error, retrying");
            tokio::select! {
                _ = tokio::time::sleep(self.config.model_retry_delay) => {}
                _ = self.cancel.cancelled() => return Err(ModelError::Cancelled),
            }
            observer.on_reply_restart();
        }
    }

    fn build_request(&self, prompt: &Prompt) -> CompletionRequest {
        let mut request = CompletionRequest::new(prompt.messages.clone()).with_streaming(self.config.stream);
        if let Some(model) = &self.config.model {
            request = request.with_model(model.clone());
        }
        if let Some(t) = self.config.temperature {
            request = request.with_temperature(t);
        }
        if let Some(max) = self.config.max_tokens {
            request = request.with_max_tokens(max);
        }
        request
    }

    async fn request<O: TurnObserver>(
        &self,
        request: CompletionRequest,
        observer: &mut O,
    ) -> Result<CompletionResponse, Error> {
        if !request.stream {
            return Ok(self.provider.complete(request).await?);
        }
        let receiver = self.provider.stream(request).await?;
        Ok(receiver.collect_with(|chunk| observer.on_reply_chunk(chunk)).await?)
    }

    fn enter<O: TurnObserver>(&self, session: &mut Session, observer: &mut O, phase: LoopPhase) {
        session.set_phase(phase);
        observer.on_phase(phase);
    }

    fn record<O: TurnObserver>(&self, session: &mut Session, observer: &mut O, turn: Turn) {
        let turn = session.append(turn);
        observer.on_turn(turn);
    }
}

fn session_timeout_failure(session: &Session) -> Outcome {
    let limit = session.budget().session_timeout.unwrap_or_default();
    Outcome::Failed(Failure::new(
        FailureKind::BudgetExhausted,
        format!("session time limit of {}s reached", limit.as_secs()),
    ))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
