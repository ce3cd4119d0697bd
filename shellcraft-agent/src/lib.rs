//! # shellcraft agent
//!
//! The agent drives the model <-> shell loop for one task:
//! 1. User provides a task description
//! 2. The model replies with at most one shell command
//! 3. The command runs in a fresh shell; its result joins the history
//! 4. The model sees the result and picks the next step
//! 5. Repeat until the model reports completion or a limit is hit
//!
//! The model decides, the shell acts.

mod agent;
mod config;
mod session;

pub use agent::{AgentLoop, LoopPhase, NoopObserver, TurnObserver};
pub use config::{AgentConfig, Budget};
pub use session::{
    Failure, FailureKind, Outcome, Session, SessionController, SessionResult, SessionState,
};
